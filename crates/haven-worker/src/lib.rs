pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod queue;

pub use engine::{SessionJanitor, WorkerEngine};
pub use jobs::{JobKind, PersistAssistantMessage};
pub use queue::JobQueue;
