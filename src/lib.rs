//! Centralized synchronization of a relational database between a trusted
//! server and many intermittently-connected clients. Application writes go
//! through a capturing [`oplog::Session`]; reconciliation happens through
//! `push`, `pull` (with the merge engine inside) and `repair`.

pub mod compress;
pub mod error;
pub mod http;
pub mod merge;
pub mod message;
pub mod oplog;
pub mod registry;
pub mod server;
pub mod signing;
pub mod store;
pub mod sync;

pub use error::{SyncError, UniqueConflictEntry};
pub use merge::{LocalWins, MergePolicy, MergeStats};
pub use oplog::{OpKind, Operation, Session};
pub use registry::{ColumnKind, ContentType, Ref, Registry};
pub use server::ServerEngine;
pub use sync::{ClientEngine, Transport};
