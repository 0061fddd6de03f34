pub mod ring;
pub mod scratch;

pub use ring::{BlockCell, BlockTag, ReadSlot, RingBuffer, RingMetrics, WriteSlot};
pub use scratch::{ScratchBuffer, ScratchMetrics, ScratchPool};
