//! Sample key/value system built on the trunkline framework.
//!
//! Five request kinds exercise the four dispatch patterns: Put and Get
//! (SingleNode), GetAll (AllNodes, suspendable stream), DoublePut
//! (MultiNode fan-out), RoundRobinPut (RoundRobin).

pub mod client;
pub mod error;
pub mod msg;
pub mod server;
pub mod storage;

pub use client::{GetAllEvent, GetAllStream, KvClient};
pub use error::{KvError, Result};
pub use server::{build_registry, KvNode, KvNodeConfig};
pub use storage::{MemStorage, Storage};
