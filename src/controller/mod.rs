//! Controller for MongoDb resources.

pub mod bootstrap;
pub mod conditions;
pub mod context;
pub mod directory;
pub mod error;
pub mod exec;
pub mod instance;
pub mod labels;
pub mod mode;
pub mod objects;
pub mod reconciler;
pub mod recovery;
pub mod restart;
pub mod sync;
pub mod topology;

/// The mongod container of every managed pod.
pub const CONTAINER_NAME: &str = "mongo";
/// mongod client port.
pub const DEFAULT_PORT: i32 = 27017;
/// Infix of per-member Service/workload names (`<instance>-svc-<n>`).
pub const SERVICE_NAME_INFIX: &str = "svc";
/// Suffix naming the arbiter Service/workload.
pub const ARBITER_NAME: &str = "arbiter";

pub use error::{Error, Result};
