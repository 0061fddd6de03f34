mod support;

use std::time::Duration;

use stager_core::request::RequestStore;
use stager_core::types::{CopyFlags, RequestFlags};
use stager_core::{FileId, MediaType, Section, StageErrno, StagerError};
use support::{FSEQ, TestResult, descriptor, multivolume_descriptor, tape_descriptor, vsn};

#[test]
fn create_assigns_slots_until_full() -> TestResult {
    let store = RequestStore::in_memory(2, 3);
    let tape = vsn("TAPE01");
    let first = store.create(&tape_descriptor(1, 100, &tape, 1))?;
    let second = store.create(&tape_descriptor(2, 100, &tape, 2))?;
    assert_ne!(first, second);
    assert_eq!(store.active_count(), 2);

    match store.create(&tape_descriptor(3, 100, &tape, 3)) {
        Err(StagerError::TableFull) => {}
        other => panic!("expected a full table, got {other:?}"),
    }
    assert_eq!(StagerError::TableFull.errno(), StageErrno::NoSpace);

    store.delete(first).ok_or("first request missing")?;
    assert_eq!(store.active_count(), 1);
    let reused = store.create(&tape_descriptor(3, 100, &tape, 3))?;
    assert_eq!(reused, first);
    Ok(())
}

#[test]
fn request_takes_retry_budget_and_flags_from_descriptor() -> TestResult {
    let store = RequestStore::in_memory(4, 5);
    let tape = vsn("TAPE01");
    let mut partial = tape_descriptor(1, 4096, &tape, 9);
    partial.offset = 1024;
    partial.stage_partial = true;
    let index = store.create(&partial)?;

    let request = store.get(index).ok_or("request missing")?;
    assert_eq!(request.retry, 5);
    assert_eq!(request.copy, 0);
    assert!(request.flags.contains(RequestFlags::SKIP_HEADER));
    assert!(request.flags.contains(RequestFlags::STAGE_PARTIAL));
    assert!(!request.size_verifiable());
    assert_eq!(request.section().position, 9);
    Ok(())
}

#[test]
fn unusable_preferred_copy_falls_back_to_next() -> TestResult {
    let store = RequestStore::in_memory(4, 3);
    let mut request = descriptor(
        1,
        100,
        &[
            (0, MediaType::Tape, Section::new(vsn("TAPE01"), 1, 0, 0)),
            (2, MediaType::Disk, Section::new(vsn("DISK01"), 4, 0, 0)),
        ],
    );
    if let Some(placement) = request.copies[0].as_mut() {
        placement.copy.flags.insert(CopyFlags::STALE);
    }
    let index = store.create(&request)?;
    assert_eq!(store.with(index, |request| request.copy), Some(2));

    request.copies[2] = None;
    match store.create(&request) {
        Err(StagerError::InvalidFormat(_)) => Ok(()),
        other => Err(format!("expected rejection, got {other:?}").into()),
    }
}

#[test]
fn done_list_is_first_in_first_out() -> TestResult {
    let store = RequestStore::in_memory(8, 3);
    let tape = vsn("TAPE01");
    let slots: Vec<_> = (1..=3)
        .map(|ino| store.create(&tape_descriptor(ino, 10, &tape, ino as u64)))
        .collect::<Result<_, _>>()?;

    store.set_done(slots[2]);
    store.set_done(slots[0]);
    store.set_done(slots[1]);
    assert_eq!(store.done_len(), 3);
    assert!(store.with(slots[0], |request| request.is_done()).unwrap_or(false));

    assert_eq!(store.take_done(), Some(slots[2]));
    assert_eq!(store.wait_for_done(Duration::from_millis(10)), Some(slots[0]));
    assert_eq!(store.take_done(), Some(slots[1]));
    assert_eq!(store.take_done(), None);
    assert_eq!(store.wait_for_done(Duration::from_millis(10)), None);
    Ok(())
}

#[test]
fn cancel_marks_the_chain_head() -> TestResult {
    let store = RequestStore::in_memory(8, 3);
    let tape = vsn("TAPE01");
    let head = store.create(&tape_descriptor(5, 10, &tape, 1))?;
    let mut follower = tape_descriptor(5, 10, &tape, 1);
    follower.ext_ord = 1;
    let held = store.create(&follower)?;
    assert!(store.with(held, |request| request.flags.contains(RequestFlags::HELD)).unwrap_or(false));

    assert_eq!(store.cancel(FileId::new(5, 1), FSEQ), Some(head));
    assert!(store.with(head, |request| request.flags.contains(RequestFlags::CANCEL)).unwrap_or(false));
    assert!(!store.with(held, |request| request.flags.contains(RequestFlags::CANCEL)).unwrap_or(true));
    assert_eq!(store.cancel(FileId::new(6, 1), FSEQ), None);

    let request = store.get(head).ok_or("head missing")?;
    assert_eq!(store.find_next_extended(&request), Some(held));
    Ok(())
}

#[test]
fn damaging_error_marks_copy_and_moves_on() -> TestResult {
    let store = RequestStore::in_memory(4, 3);
    let index = store.create(&descriptor(
        1,
        100,
        &[
            (0, MediaType::Tape, Section::new(vsn("TAPE01"), 1, 0, 0)),
            (1, MediaType::Tape, Section::new(vsn("TAPE02"), 1, 0, 0)),
        ],
    ))?;

    store.update(index, |request| request.error = Some(StageErrno::TimedOut));
    assert!(!store.damage_arcopy(index));
    assert_eq!(store.arcopy(index, 0), Some(0));

    store.update(index, |request| request.error = Some(StageErrno::HeaderFormat));
    assert!(store.damage_arcopy(index));
    assert_eq!(store.arcopy(index, 0), Some(1));
    assert_eq!(store.arcopy(index, 2), Some(1));
    Ok(())
}

#[test]
fn reopened_table_requeues_pending_and_finishes_done() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager_reqs");
    let tape = vsn("TAPE01");
    let (pending, done, retained) = {
        let store = RequestStore::open(&path, 16, 3)?;
        let pending = store.create(&tape_descriptor(1, 4096, &tape, 1))?;
        let done = store.create(&tape_descriptor(2, 4096, &tape, 2))?;
        let retained = store.create(&tape_descriptor(3, 4096, &tape, 3))?;
        store.update(pending, |request| {
            request.flags.insert(RequestFlags::ACTIVE);
            request.write_off = 2048;
        });
        store.update(done, |request| request.error = Some(StageErrno::HeaderFormat));
        store.set_done(done);
        store.update(retained, |request| {
            request.flags.insert(RequestFlags::DCACHE);
            request.write_off = 1024;
        });
        store.flush()?;
        (pending, done, retained)
    };

    let store = RequestStore::open(&path, 16, 3)?;
    assert_eq!(store.active_count(), 3);
    assert_eq!(store.take_recovered(), vec![pending]);

    let requeued = store.get(pending).ok_or("pending missing")?;
    assert!(!requeued.is_active());
    assert_eq!(requeued.write_off, 0);

    let mut finished = Vec::new();
    while let Some(index) = store.take_done() {
        finished.push(index);
    }
    finished.sort_unstable();
    let mut expected = vec![done, retained];
    expected.sort_unstable();
    assert_eq!(finished, expected);

    let lost = store.get(retained).ok_or("retained missing")?;
    assert_eq!(lost.error, Some(StageErrno::Canceled));
    assert!(lost.flags.contains(RequestFlags::NO_RETRY));
    assert!(!lost.flags.contains(RequestFlags::DCACHE));
    assert_eq!(store.get(done).and_then(|request| request.error), Some(StageErrno::HeaderFormat));

    let fresh = store.create(&tape_descriptor(4, 10, &tape, 4))?;
    let arrivals: Vec<u64> = [pending, done, retained]
        .iter()
        .filter_map(|index| store.with(*index, |request| request.arrival))
        .collect();
    let newest = store.with(fresh, |request| request.arrival).ok_or("fresh missing")?;
    assert!(arrivals.iter().all(|arrival| *arrival < newest));
    Ok(())
}

#[test]
fn corrupt_table_starts_empty() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager_reqs");
    std::fs::write(&path, b"not a request table")?;

    let store = RequestStore::open(&path, 8, 3)?;
    assert_eq!(store.active_count(), 0);
    assert!(store.take_recovered().is_empty());
    Ok(())
}

#[test]
fn table_in_missing_work_dir_is_created() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("var").join("stager").join("stager_reqs");

    let store = RequestStore::open(&path, 8, 3)?;
    store.create(&tape_descriptor(1, 10, &vsn("TAPE01"), 0))?;
    store.flush()?;
    assert!(path.is_file());
    Ok(())
}

#[test]
fn multivolume_extensions_are_addressed_by_section() -> TestResult {
    let store = RequestStore::in_memory(4, 3);
    let first = vsn("TAPE01");
    let mut request = descriptor(1, 30_000, &[(0, MediaType::Tape, Section::new(first, 10, 0, 10_000))]);
    if let Some(placement) = request.copies[0].as_mut() {
        placement.copy.n_vsns = 3;
        placement.extension = vec![
            Section::new(vsn("TAPE02"), 0, 0, 10_000),
            Section::new(vsn("TAPE03"), 0, 0, 10_000),
        ];
    }
    let index = store.create(&request)?;
    assert!(store.with(index, |request| request.flags.contains(RequestFlags::MULTIVOL)).unwrap_or(false));

    let id = FileId::new(1, 1);
    assert_eq!(store.extension_section(id, FSEQ, 0, 0, 0), None);
    assert_eq!(store.extension_section(id, FSEQ, 0, 0, 1).map(|section| section.vsn), Some(vsn("TAPE02")));
    assert_eq!(store.extension_section(id, FSEQ, 0, 0, 2).map(|section| section.vsn), Some(vsn("TAPE03")));
    assert_eq!(store.extension_section(id, FSEQ, 0, 0, 3), None);
    Ok(())
}

fn two_volume_descriptor(ino: u32) -> stager_core::StageDescriptor {
    multivolume_descriptor(
        ino,
        3000,
        &[Section::new(vsn("TAPE05"), 10, 0, 1500), Section::new(vsn("TAPE06"), 4, 0, 1500)],
    )
}

#[test]
fn deleting_a_duplicate_keeps_the_shared_extension() -> TestResult {
    let store = RequestStore::in_memory(4, 3);
    let original = store.create(&two_volume_descriptor(7))?;
    let duplicate = store.create(&two_volume_descriptor(7))?;
    let id = FileId::new(7, 1);

    store.delete(duplicate).ok_or("duplicate missing")?;
    assert_eq!(store.extension_section(id, FSEQ, 0, 0, 1).map(|section| section.vsn), Some(vsn("TAPE06")));

    store.delete(original).ok_or("original missing")?;
    assert_eq!(store.extension_section(id, FSEQ, 0, 0, 1), None);
    Ok(())
}

#[test]
fn recovered_multivolume_chain_is_failed_not_restaged() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager_reqs");
    let (midway, queued, finished) = {
        let store = RequestStore::open(&path, 8, 3)?;
        let midway = store.create(&two_volume_descriptor(1))?;
        let queued = store.create(&two_volume_descriptor(2))?;
        let finished = store.create(&two_volume_descriptor(3))?;
        store.update(midway, |request| {
            request.current_mut().section = Section::new(vsn("TAPE06"), 4, 0, 1500);
            request.se_ord = 1;
            request.vsn_cnt = 1;
            request.write_off = 1500;
            request.section_base = 1500;
            request.flags.insert(RequestFlags::ACTIVE);
        });
        store.update(finished, |request| {
            request.write_off = 3000;
            request.vsn_cnt = 2;
            request.flags.remove(RequestFlags::MULTIVOL);
        });
        store.set_done(finished);
        store.flush()?;
        (midway, queued, finished)
    };

    let store = RequestStore::open(&path, 8, 3)?;
    assert!(store.take_recovered().is_empty());

    let mut done = Vec::new();
    while let Some(index) = store.take_done() {
        done.push(index);
    }
    done.sort_unstable();
    let mut expected = vec![midway, queued, finished];
    expected.sort_unstable();
    assert_eq!(done, expected);

    for index in [midway, queued] {
        let lost = store.get(index).ok_or("request missing")?;
        assert_eq!(lost.error, Some(StageErrno::Interrupted));
        assert!(lost.flags.contains(RequestFlags::NO_RETRY));
        assert!(!lost.flags.contains(RequestFlags::MULTIVOL));
    }
    let complete = store.get(finished).ok_or("finished missing")?;
    assert_eq!(complete.error, None);
    assert_eq!(complete.write_off, 3000);
    Ok(())
}
