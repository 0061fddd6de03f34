#![cfg(feature = "telemetry")]

mod support;

use stager_core::telemetry::{self, Series, tags};
use stager_core::{FileId, MediaType, ShutdownMode};

use support::{FSEQ, RESPONSE_TIMEOUT, Site, TAPE_BLOCK, TestResult, archived, payload, tape_descriptor, vsn};

#[test]
fn media_traffic_is_counted_once_per_media_type() -> TestResult {
    let site = Site::new(1)?;
    let tape = vsn("TAPE21");
    let data = payload(2048, 21);
    let image = archived("counted", 2048, &data);
    site.write_tape(&tape, MediaType::Tape, &[(0, image.clone())])?;
    assert_eq!(image.len() % TAPE_BLOCK, 0);

    let before = telemetry::snapshot();
    let stager = site.start()?;
    site.fs.submit(tape_descriptor(21, 2048, &tape, 0));
    let response = site
        .fs
        .wait_for_response(FileId::new(21, 1), RESPONSE_TIMEOUT)
        .ok_or("no response")?;
    assert_eq!(response.result, Ok(()));
    stager.shutdown(ShutdownMode::Preserve)?;
    let after = telemetry::snapshot();

    let tape_label = [("media", "tape")];
    let delta = |name: &str| {
        after.counter_with(name, &tape_label).unwrap_or(0) - before.counter_with(name, &tape_label).unwrap_or(0)
    };
    assert_eq!(delta(tags::METRIC_MEDIA_LOAD_COUNT), 1);
    assert_eq!(delta(tags::METRIC_MEDIA_READ_BYTES), image.len() as u64);
    assert_eq!(after.counter_with(tags::METRIC_MEDIA_READ_BYTES, &[("media", "silo")]), None);
    assert_eq!(site.fs.read_cache(FileId::new(21, 1), FSEQ)?, data);
    Ok(())
}

#[test]
fn series_render_sorted_labels() {
    let series = Series {
        name: "stager.media.read.bytes".to_owned(),
        labels: vec![("media".to_owned(), "tape".to_owned()), ("op".to_owned(), "read".to_owned())],
    };
    assert_eq!(series.to_string(), "stager.media.read.bytes{media=tape,op=read}");
    assert!(series.matches("stager.media.read.bytes", &[("op", "read")]));
    assert!(!series.matches("stager.media.read.bytes", &[("media", "disk")]));
}
