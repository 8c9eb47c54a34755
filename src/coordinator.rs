use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{future, prelude::*};
use log::{info, trace, warn};
use tarpc::{
    context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};

use crate::{AssignReply, Scheduler, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Idle,
    InProgress,
    Completed,
}

#[derive(Debug, Clone)]
struct Task {
    id: usize,
    input: PathBuf,
    state: TaskState,
    assigned_at: Instant,
}

/// All scheduling state. Only ever touched with the registry mutex held,
/// so every assignment decision is totally ordered.
#[derive(Debug)]
struct Registry {
    n_reduce: usize,
    lease: Duration,
    map_tasks: Vec<Task>,
    reduce_tasks: Vec<Task>,
    map_done: usize,
    reduce_done: usize,
}

impl Registry {
    fn new(files: Vec<PathBuf>, n_reduce: usize, lease: Duration) -> Self {
        let now = Instant::now();
        let map_tasks = files
            .into_iter()
            .enumerate()
            .map(|(id, input)| Task {
                id,
                input,
                state: TaskState::Idle,
                assigned_at: now,
            })
            .collect();
        let reduce_tasks = (0..n_reduce)
            .map(|id| Task {
                id,
                input: PathBuf::new(),
                state: TaskState::Idle,
                assigned_at: now,
            })
            .collect();
        Registry {
            n_reduce,
            lease,
            map_tasks,
            reduce_tasks,
            map_done: 0,
            reduce_done: 0,
        }
    }

    fn assign(&mut self) -> AssignReply {
        let n_map = self.map_tasks.len();
        let n_reduce = self.n_reduce;
        if self.map_done < n_map {
            match Self::pick(&mut self.map_tasks, self.lease) {
                Some(t) => AssignReply {
                    id: t.id as i64,
                    kind: TaskKind::Map,
                    input: t.input.clone(),
                    n_map,
                    n_reduce,
                },
                None => Self::idle_reply(TaskKind::Wait, n_map, n_reduce),
            }
        } else if self.reduce_done < self.reduce_tasks.len() {
            match Self::pick(&mut self.reduce_tasks, self.lease) {
                Some(t) => AssignReply {
                    id: t.id as i64,
                    kind: TaskKind::Reduce,
                    input: PathBuf::new(),
                    n_map,
                    n_reduce,
                },
                None => Self::idle_reply(TaskKind::Wait, n_map, n_reduce),
            }
        } else {
            Self::idle_reply(TaskKind::Exit, n_map, n_reduce)
        }
    }

    /// Lowest-indexed idle task first; failing that, the first in-progress
    /// task whose lease has expired gets re-stamped and handed out again.
    fn pick(tasks: &mut [Task], lease: Duration) -> Option<&Task> {
        let now = Instant::now();
        if let Some(i) = tasks.iter().position(|t| t.state == TaskState::Idle) {
            let t = &mut tasks[i];
            t.state = TaskState::InProgress;
            t.assigned_at = now;
            return Some(&tasks[i]);
        }
        if let Some(i) = tasks.iter().position(|t| {
            t.state == TaskState::InProgress && now.duration_since(t.assigned_at) > lease
        }) {
            let t = &mut tasks[i];
            t.assigned_at = now;
            info!("lease expired, reassigning task {}", t.id);
            return Some(&tasks[i]);
        }
        None
    }

    fn idle_reply(kind: TaskKind, n_map: usize, n_reduce: usize) -> AssignReply {
        AssignReply {
            id: -1,
            kind,
            input: PathBuf::new(),
            n_map,
            n_reduce,
        }
    }

    fn report(&mut self, kind: TaskKind, id: i64, done: bool) {
        if !done {
            return;
        }
        let (tasks, counter) = match kind {
            TaskKind::Map => (&mut self.map_tasks, &mut self.map_done),
            TaskKind::Reduce => (&mut self.reduce_tasks, &mut self.reduce_done),
            TaskKind::Wait | TaskKind::Exit => return,
        };
        let task = match usize::try_from(id).ok().and_then(|id| tasks.get_mut(id)) {
            Some(t) => t,
            None => {
                warn!("completion report for unknown {:?} task {}", kind, id);
                return;
            }
        };
        // A straggler may report a task that was reassigned and finished
        // elsewhere. Completed is terminal and the counter counts each
        // task once, so a duplicate report is a no-op.
        if task.state != TaskState::Completed {
            task.state = TaskState::Completed;
            *counter += 1;
            trace!("{:?} task {} completed", kind, id);
        }
    }

    fn done(&self) -> bool {
        self.reduce_tasks
            .iter()
            .all(|t| t.state == TaskState::Completed)
    }
}

#[derive(Clone)]
struct SchedulerServer {
    registry: Arc<Mutex<Registry>>,
}

impl Scheduler for SchedulerServer {
    async fn assign_task(self, _: context::Context) -> AssignReply {
        self.registry.lock().unwrap().assign()
    }

    async fn report_done(self, _: context::Context, kind: TaskKind, id: i64, done: bool) {
        self.registry.lock().unwrap().report(kind, id, done)
    }
}

/// Owns the task registry and serves scheduler RPCs to workers.
#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<Mutex<Registry>>,
}

impl Coordinator {
    /// One map task per input file, `n_reduce` reduce tasks. `lease` is how
    /// long an assigned task may go unreported before it is handed out again.
    pub fn new(files: Vec<PathBuf>, n_reduce: usize, lease: Duration) -> Self {
        assert!(n_reduce > 0, "n_reduce must be non-zero");
        Coordinator {
            registry: Arc::new(Mutex::new(Registry::new(files, n_reduce, lease))),
        }
    }

    /// True once every reduce task has completed. Poll-only, no side effects.
    pub fn done(&self) -> bool {
        self.registry.lock().unwrap().done()
    }

    /// Serve scheduler RPCs on `sock` until the surrounding task is dropped.
    /// The supervising caller polls `done()` and decides when to stop.
    pub async fn serve(&self, sock: &Path) -> anyhow::Result<()> {
        // A previous run may have left its socket file behind.
        let _ = std::fs::remove_file(sock);
        let mut listener = tarpc::serde_transport::unix::listen(sock, Json::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        info!("coordinator listening on {}", sock.display());
        let server = SchedulerServer {
            registry: Arc::clone(&self.registry),
        };
        listener
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .map(|channel| channel.execute(server.clone().serve()).for_each(spawn))
            .buffer_unordered(32)
            .for_each(|_| async {})
            .await;
        Ok(())
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n_map: usize, n_reduce: usize, lease: Duration) -> Registry {
        let files = (0..n_map)
            .map(|i| PathBuf::from(format!("in-{}.txt", i)))
            .collect();
        Registry::new(files, n_reduce, lease)
    }

    #[test]
    fn map_phase_gates_reduce() {
        let mut r = registry(2, 3, Duration::from_secs(10));
        let a = r.assign();
        let b = r.assign();
        assert_eq!(a.kind, TaskKind::Map);
        assert_eq!(b.kind, TaskKind::Map);
        assert_ne!(a.id, b.id);
        // Both map tasks in flight and within lease: callers must wait.
        assert_eq!(r.assign().kind, TaskKind::Wait);
        r.report(TaskKind::Map, a.id, true);
        assert_eq!(r.assign().kind, TaskKind::Wait);
        r.report(TaskKind::Map, b.id, true);
        assert_eq!(r.assign().kind, TaskKind::Reduce);
    }

    #[test]
    fn idle_tasks_are_assigned_once_each() {
        let mut r = registry(4, 1, Duration::from_secs(10));
        let mut ids: Vec<i64> = (0..4).map(|_| r.assign().id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(r.assign().kind, TaskKind::Wait);
    }

    #[test]
    fn expired_lease_is_reassigned_exactly_once_per_expiry() {
        let mut r = registry(1, 1, Duration::from_millis(10));
        assert_eq!(r.assign().kind, TaskKind::Map);
        assert_eq!(r.assign().kind, TaskKind::Wait);
        std::thread::sleep(Duration::from_millis(20));
        let again = r.assign();
        assert_eq!(again.kind, TaskKind::Map);
        assert_eq!(again.id, 0);
        // The re-stamp renewed the lease, so the next caller waits again.
        assert_eq!(r.assign().kind, TaskKind::Wait);
    }

    #[test]
    fn completed_is_absorbing() {
        let mut r = registry(2, 1, Duration::from_millis(5));
        let t = r.assign();
        r.report(TaskKind::Map, t.id, true);
        std::thread::sleep(Duration::from_millis(10));
        // Even with its original lease long expired, a completed task is
        // never handed out again.
        let next = r.assign();
        assert_eq!(next.kind, TaskKind::Map);
        assert_ne!(next.id, t.id);
    }

    #[test]
    fn duplicate_completion_reports_count_once() {
        let mut r = registry(2, 1, Duration::from_secs(10));
        let t = r.assign();
        r.report(TaskKind::Map, t.id, true);
        r.report(TaskKind::Map, t.id, true);
        assert_eq!(r.map_done, 1);
        // The second report must not tip the phase over early.
        assert_eq!(r.assign().kind, TaskKind::Map);
    }

    #[test]
    fn negative_or_unknown_reports_are_ignored() {
        let mut r = registry(1, 1, Duration::from_secs(10));
        let t = r.assign();
        r.report(TaskKind::Map, t.id, false);
        assert_eq!(r.map_done, 0);
        r.report(TaskKind::Map, 7, true);
        r.report(TaskKind::Map, -1, true);
        r.report(TaskKind::Wait, t.id, true);
        assert_eq!(r.map_done, 0);
    }

    #[test]
    fn done_flips_after_last_reduce_and_stays() {
        let mut r = registry(1, 2, Duration::from_secs(10));
        assert!(!r.done());
        let m = r.assign();
        r.report(TaskKind::Map, m.id, true);
        let r0 = r.assign();
        let r1 = r.assign();
        assert_eq!(r0.kind, TaskKind::Reduce);
        assert_eq!(r1.kind, TaskKind::Reduce);
        r.report(TaskKind::Reduce, r0.id, true);
        assert!(!r.done());
        r.report(TaskKind::Reduce, r1.id, true);
        assert!(r.done());
        r.report(TaskKind::Reduce, r1.id, true);
        assert!(r.done());
        assert_eq!(r.assign().kind, TaskKind::Exit);
    }
}
