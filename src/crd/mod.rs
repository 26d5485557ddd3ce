//! Custom Resource Definitions for mongodb-operator.
//!
//! - `MongoDb`: a MongoDB replica set (data members plus an optional arbiter)

mod mongodb;

pub use mongodb::*;
