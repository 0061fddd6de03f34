use stager_core::worker::{CopyInstanceFlags, WORKER_RECORD_SIZE, WorkerRecord, WorkerTable};
use stager_core::{LibraryId, MediaType, Vsn};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const LAYOUT: [(LibraryId, u16); 3] = [(LibraryId(1), 0), (LibraryId(1), 1), (LibraryId(2), 0)];

fn busy_record(drive: u16) -> Result<WorkerRecord, Box<dyn std::error::Error>> {
    let mut flags = CopyInstanceFlags::CREATED;
    flags.insert(CopyInstanceFlags::FAILOVER);
    Ok(WorkerRecord {
        library: LibraryId(1),
        drive,
        pid: Some(1001),
        flags,
        position: 4242,
        lock_owner: Some(1001),
        vsn: Some(Vsn::new("TAPE07")?),
        media: Some(MediaType::Tape),
    })
}

#[test]
fn record_layout_survives_bytes() -> TestResult {
    let record = busy_record(1)?;
    let bytes = record.to_bytes();
    assert_eq!(bytes.len(), WORKER_RECORD_SIZE);
    assert_eq!(WorkerRecord::from_bytes(&bytes), Some(record));

    let empty = WorkerRecord::default().to_bytes();
    let decoded = WorkerRecord::from_bytes(&empty).ok_or("empty record rejected")?;
    assert_eq!(decoded.pid, None);
    assert_eq!(decoded.vsn, None);
    assert_eq!(WorkerRecord::from_bytes(&[0u8; WORKER_RECORD_SIZE]), None);
    assert_eq!(WorkerRecord::from_bytes(&bytes[..10]), None);
    Ok(())
}

#[test]
fn fresh_table_has_one_record_per_drive() -> TestResult {
    let dir = tempfile::tempdir()?;
    let (table, recovered) = WorkerTable::open(&dir.path().join("stager_cmd"), &LAYOUT)?;
    assert!(recovered.is_empty());
    for (index, (library, drive)) in LAYOUT.iter().enumerate() {
        let record = table.read(index).ok_or("record missing")?;
        assert_eq!(record.library, *library);
        assert_eq!(record.drive, *drive);
        assert_eq!(record.pid, None);
    }
    Ok(())
}

#[test]
fn reopened_table_returns_previous_records() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager_cmd");
    {
        let (table, _) = WorkerTable::open(&path, &LAYOUT)?;
        table.write(1, &busy_record(1)?)?;
        table.flush()?;
    }

    let (table, recovered) = WorkerTable::open(&path, &LAYOUT)?;
    assert_eq!(recovered.len(), LAYOUT.len());
    assert_eq!(recovered[1], busy_record(1)?);
    assert_eq!(recovered[0].pid, None);
    assert_eq!(table.read(1), Some(busy_record(1)?));
    Ok(())
}

#[test]
fn changed_drive_layout_discards_records() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager_cmd");
    {
        let (table, _) = WorkerTable::open(&path, &LAYOUT)?;
        table.write(0, &busy_record(0)?)?;
        table.flush()?;
    }

    let swapped = [(LibraryId(1), 0), (LibraryId(3), 1), (LibraryId(2), 0)];
    let (table, recovered) = WorkerTable::open(&path, &swapped)?;
    assert!(recovered.is_empty());
    let record = table.read(0).ok_or("record missing")?;
    assert_eq!(record.pid, None);
    assert_eq!(table.read(1).map(|record| record.library), Some(LibraryId(3)));
    Ok(())
}

#[test]
fn drive_count_change_starts_fresh() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager_cmd");
    {
        let (table, _) = WorkerTable::open(&path, &LAYOUT)?;
        table.write(0, &busy_record(0)?)?;
        table.flush()?;
    }

    let (_, recovered) = WorkerTable::open(&path, &LAYOUT[..2])?;
    assert!(recovered.is_empty());
    Ok(())
}
