//! MongoDB wire-protocol client and replica set membership algebra.

pub mod members;
pub mod mongo;
pub mod scripts;
pub mod types;

pub use mongo::{COMMAND_TIMEOUT, MongoClient};
pub use types::{Member, MemberHealth, MongoError, ReplSetConfig, ReplSetMemberStatus};
