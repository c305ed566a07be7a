#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod config;
pub mod datatypes;
pub mod encoding;
pub mod error;
pub mod replication;
pub mod storage;

pub use error::{Error, Result};
pub use replication::ReplicationManager;
