use std::thread;
use std::time::Duration;

use stager_core::buffer::RingBuffer;
use stager_core::StageErrno;

fn write_block(ring: &RingBuffer, block: u64, fill: u8, len: usize) {
    let mut slot = ring.reserve_for_write().expect("ring interrupted");
    slot[..len].fill(fill);
    slot.set_len(len);
    slot.set_block(block);
    ring.advance_write(slot);
}

#[test]
fn keeps_at_least_two_blocks() {
    let ring = RingBuffer::new(0, 64);
    assert_eq!(ring.block_count(), 2);
    assert_eq!(ring.block_size(), 64);
    assert_eq!(ring.filled_blocks(), 0);
}

#[test]
fn one_block_is_always_kept_free() {
    let ring = RingBuffer::new(4, 32);
    for block in 0..3 {
        write_block(&ring, block, block as u8, 32);
    }
    assert_eq!(ring.filled_blocks(), 3);

    let slot = ring.wait_for_data().expect("data");
    assert_eq!(slot.tag().block, Some(0));
    ring.advance_read(slot);
    assert_eq!(ring.filled_blocks(), 2);
}

#[test]
fn producer_and_consumer_see_blocks_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let ring = RingBuffer::new(3, 128);
    let total = 64u64;

    let received = thread::scope(|scope| {
        scope.spawn(|| {
            for block in 0..total {
                write_block(&ring, block, block as u8, 100);
            }
        });
        let consumer = scope.spawn(|| {
            let mut seen = Vec::new();
            for _ in 0..total {
                let slot = ring.wait_for_data().expect("data");
                assert_eq!(slot.bytes().len(), 100);
                assert!(slot.bytes().iter().all(|b| *b == slot.tag().block.unwrap_or(0) as u8));
                seen.push(slot.tag().block);
                ring.advance_read(slot);
            }
            seen
        });
        consumer.join()
    })
    .map_err(|_| "consumer panicked")?;

    let expected: Vec<_> = (0..total).map(Some).collect();
    assert_eq!(received, expected);
    let metrics = ring.metrics();
    assert_eq!(metrics.writes, total);
    assert_eq!(metrics.reads, total);
    Ok(())
}

#[test]
fn interrupt_releases_a_blocked_producer() {
    let ring = RingBuffer::new(2, 16);
    write_block(&ring, 0, 1, 16);

    let reserved = thread::scope(|scope| {
        let producer = scope.spawn(|| ring.reserve_for_write().is_some());
        thread::sleep(Duration::from_millis(50));
        ring.interrupt();
        producer.join().expect("producer panicked")
    });
    assert!(!reserved);
    assert!(ring.is_interrupted());
    assert!(ring.wait_for_data().is_none());

    ring.reset();
    assert!(!ring.is_interrupted());
    assert_eq!(ring.filled_blocks(), 0);
}

#[test]
fn interrupt_releases_a_blocked_consumer() {
    let ring = RingBuffer::new(4, 16);
    let got_data = thread::scope(|scope| {
        let consumer = scope.spawn(|| ring.wait_for_data().is_some());
        thread::sleep(Duration::from_millis(50));
        ring.interrupt();
        consumer.join().expect("consumer panicked")
    });
    assert!(!got_data);
}

#[test]
fn error_tag_reaches_the_consumer() {
    let ring = RingBuffer::new(4, 16);
    let mut slot = ring.reserve_for_write().expect("space");
    let index = slot.index();
    slot.set_error(StageErrno::Io);
    slot.set_block(7);
    ring.advance_write(slot);

    assert_eq!(ring.error(index), Some(StageErrno::Io));
    let read = ring.wait_for_data().expect("data");
    assert_eq!(read.error(), Some(StageErrno::Io));
    assert!(read.bytes().is_empty());
}

#[test]
fn set_len_is_clamped_to_the_block() {
    let ring = RingBuffer::new(2, 16);
    let mut slot = ring.reserve_for_write().expect("space");
    slot.set_len(1000);
    assert_eq!(slot.len(), 16);
    assert_eq!(slot.capacity(), 16);
}

#[test]
fn block_lookup_reuses_buffered_data() {
    let ring = RingBuffer::new(4, 32);
    for (block, fill) in [(10u64, 0xa0u8), (11, 0xb0), (12, 0xc0)] {
        write_block(&ring, block, fill, 32);
    }
    for _ in 0..3 {
        let slot = ring.wait_for_data().expect("data");
        ring.advance_read(slot);
    }
    assert_eq!(ring.filled_blocks(), 0);

    let index = ring.find_block_by_number(11).expect("block 11 buffered");
    assert_eq!(ring.block_tag(index), Some(11));
    assert_eq!(ring.filled_blocks(), 1);
    let slot = ring.wait_for_data().expect("reused block");
    assert_eq!(slot.index(), index);
    assert!(slot.bytes().iter().all(|b| *b == 0xb0));
    ring.advance_read(slot);

    assert_eq!(ring.find_block_by_number(99), None);
    assert_eq!(ring.filled_blocks(), 0);
    assert_eq!(ring.block_tag(index), None);
    let metrics = ring.metrics();
    assert_eq!(metrics.reuse_hits, 1);
    assert_eq!(metrics.reuse_misses, 1);
}

#[test]
fn errored_block_is_never_reused() {
    let ring = RingBuffer::new(4, 32);
    let mut slot = ring.reserve_for_write().expect("space");
    slot.set_block(5);
    slot.set_len(32);
    slot.set_error(StageErrno::TimedOut);
    ring.advance_write(slot);

    assert_eq!(ring.find_block_by_number(5), None);
}
