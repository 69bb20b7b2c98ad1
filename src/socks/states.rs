//! The eleven states of §4.5, as small integers indexing the state table.

pub const HELLO_READ: u8 = 0;
pub const HELLO_WRITE: u8 = 1;
pub const AUTH_READ: u8 = 2;
pub const AUTH_WRITE: u8 = 3;
pub const REQUEST_READ: u8 = 4;
pub const REQUEST_RESOLVING: u8 = 5;
pub const REQUEST_CONNECTING: u8 = 6;
pub const REQUEST_WRITE: u8 = 7;
pub const COPY: u8 = 8;
pub const DONE: u8 = 9;
pub const ERROR: u8 = 10;

pub const COUNT: u8 = 11;
