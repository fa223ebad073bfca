pub mod pool;
pub mod progress;
pub mod tasks;

pub use pool::WorkerPool;
pub use progress::{JobProgress, ProgressTracker};
pub use tasks::{TaskKind, TaskManager};
