//! Sqlite persistence for the marketplace back-office: the JobStore (this
//! process's authoritative job state) and a mirror of the external
//! system-of-record the seller site reads from.

pub mod error;
pub mod external;
pub mod jobstore;
pub mod pool;
pub mod schema;

pub use error::{DbError, Result};
pub use external::ExternalMirror;
pub use jobstore::JobStore;
pub use pool::open_sqlite_pool;
pub use schema::{ensure_external_schema, ensure_jobstore_schema};
