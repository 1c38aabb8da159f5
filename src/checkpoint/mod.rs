//! 按步快照：记录模型与文件存储

pub mod record;
pub mod store;

pub use record::{CheckpointRecord, CheckpointState};
pub use store::CheckpointStore;
