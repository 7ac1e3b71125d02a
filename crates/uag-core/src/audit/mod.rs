//! Audit trail: event records and the asynchronous sink.

mod event;
mod sink;

pub use event::{AuditEvent, AuditStatus, ExecutionMode};
pub use sink::{
    AuditSink, AuditSinkConfig, AuditStorage, Auditor, BATCH_SIZE, DEFAULT_BUFFER_CAPACITY,
    DEFAULT_FLUSH_INTERVAL,
};
