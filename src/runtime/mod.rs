//! Runtime adapters: tokio spawner and OS child-process workers.

pub mod process;
pub mod tokio_spawner;

pub use process::{launch_worker, progress_text, ChildWorker};
pub use tokio_spawner::{Spawn, TokioSpawner};
