//! Flowdesk CLI library: the command implementations behind the `flowdesk`
//! binary, exposed so integration tests exercise the same code paths.

pub mod agent;
pub mod commands;
