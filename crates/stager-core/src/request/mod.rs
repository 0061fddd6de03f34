//! Table of in-flight stage requests.

mod record;
mod store;

pub use record::{ChecksumSpec, RECORD_MAGIC, RECORD_SIZE, StageRequest};
pub use store::{RequestStore, TABLE_MAGIC, TABLE_VERSION};
