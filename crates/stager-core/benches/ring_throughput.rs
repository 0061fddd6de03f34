use std::thread;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use stager_core::buffer::RingBuffer;
use stager_core::checksum::{ChecksumAlgorithm, ChecksumState};

const TOTAL_BYTES: usize = 16 * 1024 * 1024;

fn pump(ring: &RingBuffer, total: usize) -> u64 {
    let blocks = total / ring.block_size();
    thread::scope(|scope| {
        scope.spawn(|| {
            for block in 0..blocks {
                let Some(mut slot) = ring.reserve_for_write() else {
                    return;
                };
                slot.fill(block as u8);
                let len = slot.capacity();
                slot.set_len(len);
                slot.set_block(block as u64);
                ring.advance_write(slot);
            }
        });

        let mut consumed = 0u64;
        for _ in 0..blocks {
            let Some(slot) = ring.wait_for_data() else {
                break;
            };
            consumed += black_box(slot.bytes()).len() as u64;
            ring.advance_read(slot);
        }
        consumed
    })
}

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Bytes(TOTAL_BYTES as u64));

    for (blocks, block_size) in [(4usize, 64 * 1024usize), (16, 256 * 1024)] {
        group.bench_function(format!("{blocks}x{}k", block_size / 1024), |b| {
            let ring = RingBuffer::new(blocks, block_size);
            b.iter(|| {
                ring.reset();
                pump(&ring, TOTAL_BYTES)
            })
        });
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let data = vec![0x5Au8; TOTAL_BYTES];
    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for algorithm in [ChecksumAlgorithm::Simple, ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Sha256] {
        group.bench_function(format!("{algorithm:?}"), |b| {
            b.iter(|| {
                let mut state = ChecksumState::new(algorithm, data.len() as u64, false);
                state.update(black_box(&data));
                state.value()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ring, bench_checksum);
criterion_main!(benches);
