use std::io;

use thiserror::Error;

/// Errors surfaced by the selector (epoll wrapper and awakener).
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("epoll_create1 failed: {0}")]
    Create(#[source] io::Error),
    #[error("epoll_ctl failed: {0}")]
    Ctl(#[source] io::Error),
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] io::Error),
    #[error("eventfd setup failed: {0}")]
    Awakener(#[source] io::Error),
    #[error("fd {0} is not registered")]
    NotRegistered(i32),
}

/// Errors from CLI argument parsing outside what `clap` itself reports.
#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("invalid -u argument {0:?}, expected <user>:<pass>")]
    BadUserSpec(String),
}

/// Resource-allocation failures on the accept/connect path (spec.md §7,
/// "Resource error"): socket create, non-blocking toggle, or registration
/// with the selector.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error(transparent)]
    Selector(#[from] SelectorError),
}
