pub mod queue;
pub mod store;

pub use queue::{JsonQueue, QueueItem, QueueStats, QueueStatus};
pub use store::SqliteSessionStore;
