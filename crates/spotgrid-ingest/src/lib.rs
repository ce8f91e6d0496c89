//! spotgrid-ingest — ingestion validator for agent telemetry.
//!
//! Every inbound report (price sample, heartbeat, interruption notice) is
//! normalized and sanity-checked here before it touches durable storage.
//! Price samples are appended to the raw tier; the validator never writes
//! the canonical tier. Failure is local: malformed input is rejected with
//! a reason and logged, never retried.

pub mod error;
pub mod validator;

pub use error::{IngestError, IngestResult};
pub use validator::{
    HeartbeatReport, IngestValidator, NoticeKind, NoticeReport, PriceReport, ValidHeartbeat,
    ValidNotice,
};
