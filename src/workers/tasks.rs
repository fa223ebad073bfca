use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Indexing,
    Comparison,
    Export,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Indexing, TaskKind::Comparison, TaskKind::Export];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Indexing => "indexing",
            TaskKind::Comparison => "comparison",
            TaskKind::Export => "export",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type TaskKey = (String, TaskKind);

struct TaskEntry {
    id: Uuid,
    token: CancellationToken,
    /// Closed when the job's guard drops.
    exited: watch::Receiver<()>,
}

type Registry = Arc<Mutex<HashMap<TaskKey, TaskEntry>>>;

/// Owns at most one running job per (project, kind).
#[derive(Clone, Default)]
pub struct TaskManager {
    tasks: Registry,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `job` on a blocking Tokio worker with a fresh cancellation
    /// token, cancelling whatever held the same key before. The job does not
    /// start until the one it replaced has exited.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(&self, project_id: &str, kind: TaskKind, job: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let key = (project_id.to_string(), kind);
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let (exit_signal, exited) = watch::channel(());

        let previous = lock(&self.tasks).insert(
            key.clone(),
            TaskEntry {
                id,
                token: token.clone(),
                exited,
            },
        );
        let predecessor = previous.map(|previous| {
            log::info!("Replacing running {} task for project {}", kind, project_id);
            previous.token.cancel();
            previous.exited
        });

        let guard = TaskGuard {
            tasks: Arc::clone(&self.tasks),
            key,
            id,
            _exit_signal: exit_signal,
        };

        tokio::spawn(async move {
            if let Some(mut predecessor) = predecessor {
                // resolves with an error once the sender is gone
                let _ = predecessor.changed().await;
            }

            let result = tokio::task::spawn_blocking(move || {
                let _guard = guard;
                job(token);
            })
            .await;

            if let Err(e) = result {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        })
    }

    /// Signal the job for `(project_id, kind)`. It leaves the registry when it exits.
    pub fn cancel(&self, project_id: &str, kind: TaskKind) -> bool {
        match lock(&self.tasks).get(&(project_id.to_string(), kind)) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every job of a project. Returns how many were signalled.
    pub fn cancel_all(&self, project_id: &str) -> usize {
        let tasks = lock(&self.tasks);
        let mut signalled = 0;
        for ((project, _), entry) in tasks.iter() {
            if project == project_id {
                entry.token.cancel();
                signalled += 1;
            }
        }
        signalled
    }

    /// Signal every job of a project and wait until all of them have exited.
    /// Returns how many were stopped.
    pub async fn stop_project(&self, project_id: &str) -> usize {
        let exits: Vec<watch::Receiver<()>> = lock(&self.tasks)
            .iter()
            .filter(|((project, _), _)| project == project_id)
            .map(|(_, entry)| {
                entry.token.cancel();
                entry.exited.clone()
            })
            .collect();

        let stopped = exits.len();
        for mut exited in exits {
            let _ = exited.changed().await;
        }
        stopped
    }

    pub fn is_running(&self, project_id: &str, kind: TaskKind) -> bool {
        lock(&self.tasks).contains_key(&(project_id.to_string(), kind))
    }

    pub fn running(&self, project_id: &str) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| self.is_running(project_id, *kind))
            .collect()
    }
}

/// Removes its registry entry when the job exits, unless a newer job
/// already took the key.
struct TaskGuard {
    tasks: Registry,
    key: TaskKey,
    id: Uuid,
    // dropped after `drop` runs, so waiters see the entry already gone
    _exit_signal: watch::Sender<()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut tasks = lock(&self.tasks);
        if tasks.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            tasks.remove(&self.key);
        }
    }
}

fn lock(tasks: &Registry) -> MutexGuard<'_, HashMap<TaskKey, TaskEntry>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}
