//! Checklist document → task tree, kept current by a debounced file watcher.

pub mod parser;
pub mod watcher;

pub use parser::{ParsedTasks, parse_document, snapshot, task_id};
pub use watcher::{DEFAULT_DEBOUNCE, DEFAULT_TASK_FILE_NAME, TaskSource, TaskWatcher, load_snapshot};
