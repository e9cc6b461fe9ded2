pub mod activity;
pub mod json;
pub mod lock;
pub mod workspace;

pub use activity::{prune_dated_logs, ActivityLog};
pub use json::{read_json, read_json_or, write_json_atomic};
pub use lock::{is_process_alive, ProcessLock};
pub use workspace::Workspace;
