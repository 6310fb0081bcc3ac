//! Side-effecting helpers: files, subprocesses and notifications.

pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod notify;
pub mod process;
pub mod prompt;
