//! Control-command grammar.
//!
//! A single parse step turns message text into a tagged variant; the daemon
//! matches exhaustively. Anything that does not parse is ordinary task input.

use crate::util::first_number;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/task-list [n]` — list recent tasks for this chat.
    TaskList { limit: usize },
    /// `/task-new [seed]` — unconditionally start and activate a new task.
    TaskNew { seed: String },
    /// `/task-activate <selector>` — switch the chat's active task.
    TaskActivate { selector: String },
    /// `/s` — daemon status overview.
    Status,
    /// `/h` — command reference.
    Help,
}

pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.split_whitespace();
    let head = parts.next()?;
    let rest = parts.collect::<Vec<_>>().join(" ");

    match head.to_lowercase().as_str() {
        "/task-list" => {
            let limit = first_number(&rest)
                .map(|n| (n as usize).clamp(1, MAX_LIST_LIMIT))
                .unwrap_or(DEFAULT_LIST_LIMIT);
            Some(Command::TaskList { limit })
        }
        "/task-new" => Some(Command::TaskNew { seed: rest }),
        "/task-activate" => Some(Command::TaskActivate { selector: rest }),
        "/s" | "/status" => Some(Command::Status),
        "/h" | "/help" => Some(Command::Help),
        _ => None,
    }
}

pub fn help_text() -> String {
    [
        "taskforge commands",
        "",
        "Just send a message to work in the active task session.",
        "",
        "Task management:",
        "  /task-new [summary] — start a new task",
        "  /task-list [n] — list recent tasks",
        "  /task-activate <task_id|search> — switch tasks",
        "",
        "Quick commands:",
        "  /s — daemon status",
        "  /h — this help",
    ]
    .join("\n")
}
