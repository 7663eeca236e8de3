//! Session event log for the relay.
//!
//! Events are written one JSON object per line. Callers log through an
//! [`AuditSink`], which is cheap to clone; a single writer task owns the
//! file. Logging never waits on that task: if it falls behind and the queue
//! fills up, new entries are dropped with a warning. A sink built with
//! [`AuditSink::disabled`] accepts and discards everything, so call sites do
//! not need to care whether logging is configured.
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (events, writer) = AuditSink::start("/var/log/wsbridge/events.jsonl").await?;
//!
//! let source = AuditSource::new("ws-relay")
//!     .with_session(uuid::Uuid::new_v4(), "203.0.113.7:51234")
//!     .with_origin(Some("https://app.example.com"));
//! events.log(AuditEntry::new(
//!     AuditEventType::ConnectionOpened,
//!     source,
//!     serde_json::json!({ "upstream": "ws://localhost:1323/ws" }),
//! ));
//!
//! // The writer flushes and exits once every sink is dropped.
//! drop(events);
//! writer.await?;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
