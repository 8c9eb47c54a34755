//! A small map/reduce runtime: one coordinator hands tasks to a pool of
//! stateless workers over a local RPC socket.

use std::env;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

pub mod app;
mod coordinator;
mod worker;
pub use coordinator::Coordinator;
pub use worker::{MapFn, ReduceFn, Worker};

#[tarpc::service]
pub trait Scheduler {
    /// Ask for the next task. `Wait` (id -1) means poll again shortly;
    /// `Exit` means the job is finished and the worker should shut down.
    async fn assign_task() -> AssignReply;
    /// Report the outcome of a previously assigned task.
    async fn report_done(kind: TaskKind, id: i64, done: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
    Wait,
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignReply {
    pub id: i64,
    pub kind: TaskKind,
    /// Input file for a map task; empty otherwise.
    pub input: PathBuf,
    pub n_map: usize,
    pub n_reduce: usize,
}

/// One intermediate record, produced by map and consumed by reduce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Reduce partition for a key: FNV-1a hash masked to 31 bits, mod nReduce.
pub fn bucket_of(key: &str, n_reduce: usize) -> usize {
    let mut h = FnvHasher::default();
    key.hash(&mut h);
    (h.finish() as usize & 0x7fff_ffff) % n_reduce
}

/// Well-known coordinator socket for a single-host job, namespaced per user.
pub fn coordinator_sock() -> PathBuf {
    let user = env::var("USER").unwrap_or_else(|_| "nobody".to_owned());
    env::temp_dir().join(format!("mr-{}.sock", user))
}
