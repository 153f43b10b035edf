pub mod admission;
pub mod audit;
pub mod client;
pub mod counters;
pub mod error;
pub mod execution;
pub mod holdings;

pub use admission::{AdmissionController, AdmissionPermit};
pub use audit::{AuditRecord, AuditSink, InMemoryAuditLog, JsonLinesAuditLog};
pub use client::{Holding, OrderClient, OrderRequest, PaperOrderClient, Rejection};
pub use counters::{CounterStore, LocalCounters, SharedCounters};
pub use error::{AdmissionDenied, ExecutionError, OrderError, SharedCounterError};
pub use execution::{ExecutionContext, ExecutionPipeline, QueuedOpportunity};
pub use holdings::HoldingsBook;
