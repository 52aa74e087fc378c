pub mod call_logs;
pub mod mailboxes;
pub mod overwrites;
