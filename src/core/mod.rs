//! 核心层：错误分类、事件端口、优雅关闭、引擎装配

pub mod engine;
pub mod error;
pub mod events;
pub mod shutdown;

pub use engine::{Engine, EngineBuilder, EngineOutcome, EngineReport};
pub use error::{EngineError, ErrorKind};
pub use events::{CollectingSink, EngineEvent, EventSink, ProgressSink, TracingSink};
pub use shutdown::{ShutdownManager, ShutdownReason};
