mod support;

use std::thread;
use std::time::{Duration, Instant};

use stager_core::checksum::{ChecksumAlgorithm, ChecksumValue, checksum_of};
use stager_core::collab::ChecksumRequest;
use stager_core::{FileId, MediaType, Section, ShutdownMode, StageErrno};
use support::{
    FSEQ, RESPONSE_TIMEOUT, Site, TestResult, archived, descriptor, multivolume_descriptor, payload,
    tape_descriptor, vsn,
};

#[test]
fn stages_classic_file_from_tape() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE01");
    let data = payload(8192, 7);
    site.write_tape(&tape, MediaType::Tape, &[(5, archived("file", 8192, &data))])?;

    let stager = site.start()?;
    site.fs.submit(tape_descriptor(100, 8192, &tape, 5));
    let response = site
        .fs
        .wait_for_response(FileId::new(100, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;

    let staged = site.fs.read_cache(FileId::new(100, 1), FSEQ)?;
    assert_eq!(staged.len(), 8192);
    assert_eq!(staged, data);
    assert_eq!(site.fs.responses().len(), 1);
    Ok(())
}

#[test]
fn header_size_mismatch_fails_without_second_copy() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE01");
    let data = payload(8192, 3);
    site.write_tape(&tape, MediaType::Tape, &[(5, archived("file", 4096, &data))])?;

    let stager = site.start()?;
    site.fs.submit(tape_descriptor(100, 8192, &tape, 5));
    let response = site
        .fs
        .wait_for_response(FileId::new(100, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::HeaderFormat));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;

    assert_eq!(site.fs.responses().len(), 1);
    Ok(())
}

#[test]
fn damaged_copy_switches_to_disk_archive() -> TestResult {
    let site = Site::new(2)?;
    let tape = vsn("TAPE01");
    let disk = vsn("DISK01");
    let data = payload(6000, 11);
    site.write_tape(&tape, MediaType::Tape, &[(5, archived("file", 1234, &data))])?;
    site.write_disk_archive(&disk, 42, &archived("file", 6000, &data))?;

    let stager = site.start()?;
    site.fs.submit(descriptor(
        7,
        6000,
        &[
            (0, MediaType::Tape, Section::new(tape.clone(), 5, 0, 0)),
            (1, MediaType::Disk, Section::new(disk.clone(), 42, 0, 0)),
        ],
    ));
    let response = site
        .fs
        .wait_for_response(FileId::new(7, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;

    assert_eq!(site.fs.read_cache(FileId::new(7, 1), FSEQ)?, data);
    Ok(())
}

#[test]
fn stages_headerless_silo_object() -> TestResult {
    let site = Site::new(1)?;
    let silo = vsn("SILO01");
    let data = payload(100_000, 5);
    site.write_silo_object(&silo, 3, &data)?;

    let stager = site.start()?;
    site.fs.submit(descriptor(
        9,
        data.len() as u64,
        &[(0, MediaType::Silo, Section::new(silo.clone(), 3, 0, 0))],
    ));
    let response = site
        .fs
        .wait_for_response(FileId::new(9, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    stager.shutdown(ShutdownMode::Preserve)?;

    assert_eq!(site.fs.read_cache(FileId::new(9, 1), FSEQ)?, data);
    Ok(())
}

#[test]
fn files_on_one_tape_share_a_stream() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE02");
    let first = payload(3000, 1);
    let second = payload(700, 2);
    site.write_tape(
        &tape,
        MediaType::Tape,
        &[(2, archived("a", 3000, &first)), (20, archived("b", 700, &second))],
    )?;

    let stager = site.start()?;
    site.fs.submit(tape_descriptor(2, 700, &tape, 20));
    site.fs.submit(tape_descriptor(1, 3000, &tape, 2));
    for ino in [1, 2] {
        let response = site
            .fs
            .wait_for_response(FileId::new(ino, 1), RESPONSE_TIMEOUT)
            .ok_or("no response")?;
        assert_eq!(response.result, Ok(()), "inode {ino}");
    }
    stager.shutdown(ShutdownMode::Preserve)?;

    assert_eq!(site.fs.read_cache(FileId::new(1, 1), FSEQ)?, first);
    assert_eq!(site.fs.read_cache(FileId::new(2, 1), FSEQ)?, second);
    Ok(())
}

#[test]
fn multivolume_file_is_staged_across_volumes() -> TestResult {
    let site = Site::new(1)?;
    let (first_tape, second_tape) = (vsn("TAPE05"), vsn("TAPE06"));
    let data = payload(3000, 11);
    let (head, tail) = data.split_at(1500);
    site.write_tape(&first_tape, MediaType::Tape, &[(10, archived("split", 3000, head))])?;
    let mut rest = tail.to_vec();
    rest.resize(1536, 0);
    site.write_tape(&second_tape, MediaType::Tape, &[(4, rest)])?;

    let sections = [Section::new(first_tape, 10, 0, 1500), Section::new(second_tape, 4, 0, 1500)];

    let stager = site.start()?;
    site.fs.submit(multivolume_descriptor(30, 3000, &sections));
    let response = site
        .fs
        .wait_for_response(FileId::new(30, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;

    assert_eq!(site.fs.read_cache(FileId::new(30, 1), FSEQ)?, data);
    assert_eq!(site.fs.responses().len(), 1);
    Ok(())
}

#[test]
fn duplicate_of_multivolume_file_leaves_the_chain_intact() -> TestResult {
    let site = Site::new(1)?;
    let (first_tape, second_tape) = (vsn("TAPE15"), vsn("TAPE16"));
    let data = payload(3000, 12);
    let (head, tail) = data.split_at(1500);
    site.write_tape(&first_tape, MediaType::Tape, &[(10, archived("split", 3000, head))])?;
    let mut rest = tail.to_vec();
    rest.resize(1536, 0);
    site.write_tape(&second_tape, MediaType::Tape, &[(4, rest)])?;
    site.catalog
        .update_volume(&first_tape, MediaType::Tape, |volume| volume.unavailable = true);

    let sections = [
        Section::new(first_tape.clone(), 10, 0, 1500),
        Section::new(second_tape, 4, 0, 1500),
    ];
    let stager = site.start()?;
    let id = FileId::new(31, 1);
    site.fs.submit(multivolume_descriptor(31, 3000, &sections));
    site.fs.submit(multivolume_descriptor(31, 3000, &sections));
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while site.fs.responses().is_empty() {
        assert!(Instant::now() < deadline, "duplicate never answered");
        thread::sleep(Duration::from_millis(10));
    }

    site.catalog
        .update_volume(&first_tape, MediaType::Tape, |volume| volume.unavailable = false);
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;

    let results: Vec<_> = site
        .fs
        .responses()
        .into_iter()
        .filter(|response| response.id == id)
        .map(|response| response.result)
        .collect();
    assert_eq!(results, vec![Err(StageErrno::AlreadyExists), Ok(())]);
    assert_eq!(site.fs.read_cache(id, FSEQ)?, data);
    Ok(())
}

#[test]
fn verified_checksum_completes() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE03");
    let data = payload(5000, 9);
    site.write_tape(&tape, MediaType::Tape, &[(1, archived("sum", 5000, &data))])?;
    let id = FileId::new(31, 1);
    site.fs
        .record_checksum(id, FSEQ, checksum_of(ChecksumAlgorithm::Simple, &data, 5000, false));

    let stager = site.start()?;
    let mut request = tape_descriptor(31, 5000, &tape, 1);
    request.checksum = Some(ChecksumRequest {
        algorithm: ChecksumAlgorithm::Simple,
        long_name: false,
    });
    site.fs.submit(request);
    let response = site
        .fs
        .wait_for_response(id, RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    stager.shutdown(ShutdownMode::Preserve)?;
    Ok(())
}

#[test]
fn checksum_mismatch_without_other_copy_is_terminal() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE03");
    let data = payload(5000, 9);
    site.write_tape(&tape, MediaType::Tape, &[(1, archived("sum", 5000, &data))])?;
    let id = FileId::new(32, 1);
    site.fs.record_checksum(id, FSEQ, ChecksumValue([1, 2, 3, 4]));

    let stager = site.start()?;
    let mut request = tape_descriptor(32, 5000, &tape, 1);
    request.checksum = Some(ChecksumRequest {
        algorithm: ChecksumAlgorithm::Crc32,
        long_name: false,
    });
    site.fs.submit(request);
    let response = site
        .fs
        .wait_for_response(id, RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::ChecksumMismatch));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;
    assert_eq!(site.fs.responses().len(), 1);
    Ok(())
}

#[test]
fn unavailable_volume_waits_for_reload() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE04");
    let data = payload(2048, 4);
    site.write_tape(&tape, MediaType::Tape, &[(0, archived("late", 2048, &data))])?;
    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.unavailable = true);

    let stager = site.start()?;
    let id = FileId::new(40, 1);
    site.fs.submit(tape_descriptor(40, 2048, &tape, 0));

    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while site.catalog.load_requests().is_empty() {
        assert!(Instant::now() < deadline, "load was never requested");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(site.fs.responses().is_empty());
    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.unavailable = false);

    let response = site
        .fs
        .wait_for_response(id, RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    stager.shutdown(ShutdownMode::Preserve)?;
    assert_eq!(site.catalog.load_requests(), vec![tape]);
    Ok(())
}

#[test]
fn unattended_site_fails_unavailable_volume() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE05");
    site.write_tape(&tape, MediaType::Tape, &[(0, archived("x", 10, b"0123456789"))])?;
    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.unavailable = true);

    let mut config = site.config();
    config.scheduler.attended = false;
    let stager = site.start_with(config)?;
    site.fs.submit(tape_descriptor(50, 10, &tape, 0));
    let response = site
        .fs
        .wait_for_response(FileId::new(50, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::NoDevice));
    stager.shutdown(ShutdownMode::Preserve)?;
    assert!(site.catalog.load_requests().is_empty());
    Ok(())
}

#[test]
fn bad_media_fails_with_no_space() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE06");
    site.write_tape(&tape, MediaType::Tape, &[(0, archived("x", 10, b"0123456789"))])?;
    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.bad_media = true);

    let stager = site.start()?;
    site.fs.submit(tape_descriptor(60, 10, &tape, 0));
    let response = site
        .fs
        .wait_for_response(FileId::new(60, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::NoSpace));
    stager.shutdown(ShutdownMode::Preserve)?;
    Ok(())
}

#[test]
fn cancel_while_waiting_for_volume() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE07");
    site.write_tape(&tape, MediaType::Tape, &[(0, archived("x", 10, b"0123456789"))])?;
    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.unavailable = true);

    let stager = site.start()?;
    let id = FileId::new(70, 1);
    site.fs.submit(tape_descriptor(70, 10, &tape, 0));
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while site.catalog.load_requests().is_empty() {
        assert!(Instant::now() < deadline, "load was never requested");
        thread::sleep(Duration::from_millis(10));
    }

    site.fs.cancel(id, FSEQ);
    let response = site
        .fs
        .wait_for_response(id, RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::Canceled));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;
    Ok(())
}

#[test]
fn cancel_while_copying_to_cache() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE08");
    let data = payload(64 * 1024, 8);
    site.write_tape(&tape, MediaType::Tape, &[(0, archived("big", data.len() as u64, &data))])?;
    site.fs.hold_writes();

    let stager = site.start()?;
    let id = FileId::new(80, 1);
    site.fs.submit(tape_descriptor(80, data.len() as u64, &tape, 0));
    assert!(site.fs.wait_for_held_write(RESPONSE_TIMEOUT), "staging never reached the cache");

    assert!(stager.context().cancel_request(id, FSEQ).is_some());
    site.fs.release_writes();
    let response = site
        .fs
        .wait_for_response(id, RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::Canceled));
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;
    assert_eq!(site.fs.responses().len(), 1);
    Ok(())
}

#[test]
fn duplicate_request_is_answered_once_as_existing() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE08");
    let data = payload(1024, 8);
    site.write_tape(&tape, MediaType::Tape, &[(3, archived("dup", 1024, &data))])?;
    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.unavailable = true);

    let stager = site.start()?;
    let id = FileId::new(80, 1);
    site.fs.submit(tape_descriptor(80, 1024, &tape, 3));
    site.fs.submit(tape_descriptor(80, 1024, &tape, 3));
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while site.fs.responses().is_empty() {
        assert!(Instant::now() < deadline, "duplicate never answered");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(site.fs.responses()[0].result, Err(StageErrno::AlreadyExists));

    site.catalog
        .update_volume(&tape, MediaType::Tape, |volume| volume.unavailable = false);
    assert!(stager.wait_idle(RESPONSE_TIMEOUT));
    stager.shutdown(ShutdownMode::Preserve)?;

    let results: Vec<_> = site
        .fs
        .responses()
        .into_iter()
        .filter(|response| response.id == id)
        .map(|response| response.result)
        .collect();
    assert_eq!(results, vec![Err(StageErrno::AlreadyExists), Ok(())]);
    assert_eq!(site.fs.read_cache(id, FSEQ)?, data);
    Ok(())
}

#[test]
fn fail_queued_shutdown_answers_waiting_requests() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE09");
    site.write_tape(&tape, MediaType::Tape, &[(0, archived("x", 10, b"0123456789"))])?;
    site.catalog.suspend(MediaType::Tape, true);

    let stager = site.start()?;
    let id = FileId::new(90, 1);
    site.fs.submit(tape_descriptor(90, 10, &tape, 0));
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    while stager.context().store.active_count() == 0 {
        assert!(Instant::now() < deadline, "request never accepted");
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(100));
    assert!(site.fs.responses().is_empty());

    stager.shutdown(ShutdownMode::FailQueued)?;
    let responses = site.fs.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, id);
    assert_eq!(responses[0].result, Err(StageErrno::NoDevice));
    Ok(())
}
