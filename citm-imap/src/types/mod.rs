pub mod command;
pub mod core;
pub mod datetime;
pub mod fetch;
pub mod flag;
pub mod mailbox;
pub mod response;
pub mod search;
pub mod sequence;
