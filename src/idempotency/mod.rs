pub mod executors;
pub mod fingerprint;
pub mod handler;
pub mod memory;
pub mod storage;

pub use executors::{Command, Query, Request, RequestReply};
pub use fingerprint::{fingerprint, Fingerprint};
pub use handler::{IdempotencyHandler, IdempotencyHandlerConfig, IdempotencyMetrics, MetricsSnapshot};
pub use memory::InMemoryRecordStore;
pub use storage::{IdempotencyRecord, IdempotencyStatus, RecordStore, RedisRecordStore};
