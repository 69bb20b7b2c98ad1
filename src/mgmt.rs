//! The management/administration protocol: a line-oriented, CRLF-terminated
//! text protocol, grounded in `original_source/src/server/mgmt.c`. Driven by
//! the same [`Stm`] runtime and [`Selector`] as the SOCKS engine (spec.md
//! §5's single-threaded scheduling model), bound to loopback only.
//!
//! States: `AUTH` (await `AUTH <user> <pass>` against the hardcoded admin
//! credential) → `CMD` (await one line, dispatch) → `WRITE` (drain the
//! response buffer) → back to `CMD`, or `DONE`/`ERROR`.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::buffer::Buffer;
use crate::metrics::Metrics;
use crate::net;
use crate::selector::{Handlers, Interest, Key, Selector, SelectorHandle, Token};
use crate::stm::{StateDef, Stm};
use crate::users::Users;

const BUFFER_CAPACITY: usize = 4096;
const MAX_LINE: usize = 4096;

// Hardcoded per original_source/src/server/mgmt.c; this crate does not add
// configurability beyond what the reference exposes.
const ADMIN_USER: &str = "admin";
const ADMIN_PASS: &str = "admin123";

mod states {
    pub const AUTH: u8 = 0;
    pub const CMD: u8 = 1;
    pub const WRITE: u8 = 2;
    pub const DONE: u8 = 3;
    pub const ERROR: u8 = 4;
    pub const COUNT: u8 = 5;
}

pub struct SharedCtx {
    pub users: Rc<Users>,
    pub metrics: Rc<Metrics>,
    #[allow(dead_code)]
    pub selector_handle: SelectorHandle,
}

struct SessionCtx {
    shared: Rc<SharedCtx>,
    self_ref: Weak<RefCell<Session>>,
    fd: RawFd,

    buf_in: Buffer,
    buf_out: Buffer,

    authenticated: bool,
    next_after_write: u8,
    torn_down: bool,
}

pub struct Session {
    stm: Stm<SessionCtx>,
    ctx: SessionCtx,
}

impl Session {
    pub fn accept(selector: &Selector, shared: Rc<SharedCtx>, fd: RawFd) -> Result<Rc<RefCell<Session>>, crate::error::SelectorError> {
        let ctx = SessionCtx {
            shared,
            self_ref: Weak::new(),
            fd,
            buf_in: Buffer::with_capacity(BUFFER_CAPACITY),
            buf_out: Buffer::with_capacity(BUFFER_CAPACITY),
            authenticated: false,
            next_after_write: states::CMD,
            torn_down: false,
        };
        let session = Rc::new(RefCell::new(Session {
            stm: Stm::new(build_table(), states::AUTH),
            ctx,
        }));
        session.borrow_mut().ctx.self_ref = Rc::downgrade(&session);

        let handler: Box<dyn Handlers> = Box::new(SessionHandler(session.clone()));
        selector.register(fd, Token(fd as usize), handler, Interest::WRITABLE)?;

        {
            let mut s = session.borrow_mut();
            let key = Key {
                selector,
                fd,
                token: Token(fd as usize),
            };
            let Session { stm, ctx } = &mut *s;
            stm.start(ctx, &key);
        }

        Ok(session)
    }
}

struct SessionHandler(Rc<RefCell<Session>>);

impl Handlers for SessionHandler {
    fn handle_read(&mut self, key: &Key) {
        let mut s = self.0.borrow_mut();
        let Session { stm, ctx } = &mut *s;
        stm.handle_read(ctx, key);
    }

    fn handle_write(&mut self, key: &Key) {
        let mut s = self.0.borrow_mut();
        let Session { stm, ctx } = &mut *s;
        stm.handle_write(ctx, key);
    }

    fn handle_close(&mut self, key: &Key) {
        let mut s = self.0.borrow_mut();
        let Session { stm, ctx } = &mut *s;
        if stm.state() != states::DONE && stm.state() != states::ERROR {
            stm.force(states::ERROR, ctx, key);
        }
    }
}

enum Fill {
    WouldBlock,
    Eof,
    Some,
}

fn fill(fd: RawFd, buf: &mut Buffer) -> Fill {
    match net::read(fd, buf.write_slice()) {
        Ok(None) => Fill::WouldBlock,
        Ok(Some(0)) => Fill::Eof,
        Ok(Some(n)) => {
            buf.write_adv(n);
            Fill::Some
        }
        Err(_) => Fill::Eof,
    }
}

enum Drain {
    WouldBlock,
    Partial,
    Complete,
    Err,
}

fn drain(fd: RawFd, buf: &mut Buffer) -> Drain {
    if buf.is_empty() {
        return Drain::Complete;
    }
    match net::write(fd, buf.read_slice()) {
        Ok(None) => Drain::WouldBlock,
        Ok(Some(n)) => {
            buf.read_adv(n);
            if buf.is_empty() {
                Drain::Complete
            } else {
                Drain::Partial
            }
        }
        Err(_) => Drain::Err,
    }
}

/// Finds a CRLF-terminated line in the readable span; returns the line
/// (without the terminator) and the number of bytes to advance past,
/// leaving any following bytes for the next parse. `None` means incomplete.
fn find_line(buf: &[u8]) -> Option<(&str, usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    std::str::from_utf8(&buf[..pos]).ok().map(|s| (s, pos + 2))
}

fn queue_response(ctx: &mut SessionCtx, line: &str) {
    ctx.buf_out.reset();
    for &b in line.as_bytes() {
        let ok = ctx.buf_out.write_one(b);
        debug_assert!(ok, "management response longer than buffer capacity");
    }
    let _ = ctx.buf_out.write_one(b'\r');
    let _ = ctx.buf_out.write_one(b'\n');
}

// ---- AUTH ----

fn auth_arrival(_prev: u8, ctx: &mut SessionCtx, key: &Key) -> u8 {
    ctx.buf_in.reset();
    let _ = key.selector.set_interest(ctx.fd, Interest::READABLE);
    states::AUTH
}

fn auth_on_read(ctx: &mut SessionCtx, key: &Key) -> u8 {
    match fill(ctx.fd, &mut ctx.buf_in) {
        Fill::WouldBlock => return states::AUTH,
        Fill::Eof => return states::ERROR,
        Fill::Some => {}
    }
    let (line, consumed) = match find_line(ctx.buf_in.read_slice()) {
        Some(pair) => (pair.0.to_string(), pair.1),
        None => {
            if ctx.buf_in.can_read() >= MAX_LINE {
                return states::ERROR;
            }
            return states::AUTH;
        }
    };
    ctx.buf_in.read_adv(consumed);
    ctx.buf_in.reset();

    let mut parts = line.trim().splitn(3, ' ');
    let cmd = parts.next().unwrap_or("");
    if !cmd.eq_ignore_ascii_case("AUTH") {
        queue_response(ctx, "-ERR authenticate first");
        ctx.next_after_write = states::AUTH;
        let _ = key.selector.set_interest(ctx.fd, Interest::WRITABLE);
        return states::WRITE;
    }
    let user = parts.next().unwrap_or("");
    let pass = parts.next().unwrap_or("");
    if user == ADMIN_USER && pass == ADMIN_PASS {
        ctx.authenticated = true;
        queue_response(ctx, "+OK authenticated");
        ctx.next_after_write = states::CMD;
    } else {
        queue_response(ctx, "-ERR bad credentials");
        ctx.next_after_write = states::AUTH;
    }
    let _ = key.selector.set_interest(ctx.fd, Interest::WRITABLE);
    states::WRITE
}

// ---- CMD ----

fn cmd_arrival(_prev: u8, ctx: &mut SessionCtx, key: &Key) -> u8 {
    ctx.buf_in.reset();
    let _ = key.selector.set_interest(ctx.fd, Interest::READABLE);
    states::CMD
}

fn format_stats(metrics: &Metrics) -> String {
    let snap = metrics.snapshot();
    format!(
        "+OK total_connections={} current_connections={} bytes_transferred={} successful_connections={} failed_connections={} bytes_sent={} bytes_received={}",
        snap.total_connections,
        snap.current_connections,
        snap.bytes_transferred,
        snap.successful_connections,
        snap.failed_connections,
        snap.bytes_sent,
        snap.bytes_received,
    )
}

fn format_users(users: &Users) -> String {
    let mut names = Vec::new();
    users.foreach(|u| names.push(u.to_string()));
    format!("+OK {}", names.join(","))
}

const HELP_TEXT: &str = "+OK commands: AUTH <user> <pass>, STATS, USERS, ADDUSER <user> <pass>, DELUSER <user>, HELP, QUIT";

fn dispatch(ctx: &SessionCtx, line: &str) -> (String, u8) {
    let mut parts = line.trim().splitn(3, ' ');
    let cmd = parts.next().unwrap_or("").to_ascii_uppercase();
    match cmd.as_str() {
        "STATS" => (format_stats(&ctx.shared.metrics), states::CMD),
        "USERS" => (format_users(&ctx.shared.users), states::CMD),
        "ADDUSER" => {
            let user = parts.next().unwrap_or("");
            let pass = parts.next().unwrap_or("");
            if ctx.shared.users.add(user, pass) {
                ("+OK user added".to_string(), states::CMD)
            } else {
                ("-ERR could not add user".to_string(), states::CMD)
            }
        }
        "DELUSER" => {
            let user = parts.next().unwrap_or("");
            if ctx.shared.users.remove(user) {
                ("+OK user removed".to_string(), states::CMD)
            } else {
                ("-ERR no such user".to_string(), states::CMD)
            }
        }
        "HELP" => (HELP_TEXT.to_string(), states::CMD),
        "QUIT" => ("+OK bye".to_string(), states::DONE),
        "" => ("-ERR empty command".to_string(), states::CMD),
        other => (format!("-ERR unknown command {}", other), states::CMD),
    }
}

fn cmd_on_read(ctx: &mut SessionCtx, key: &Key) -> u8 {
    if !ctx.authenticated {
        return states::ERROR;
    }
    match fill(ctx.fd, &mut ctx.buf_in) {
        Fill::WouldBlock => return states::CMD,
        Fill::Eof => return states::ERROR,
        Fill::Some => {}
    }
    let (line, consumed) = match find_line(ctx.buf_in.read_slice()) {
        Some(pair) => (pair.0.to_string(), pair.1),
        None => {
            if ctx.buf_in.can_read() >= MAX_LINE {
                return states::ERROR;
            }
            return states::CMD;
        }
    };
    ctx.buf_in.read_adv(consumed);
    ctx.buf_in.reset();

    let (response, next) = dispatch(ctx, &line);
    queue_response(ctx, &response);
    ctx.next_after_write = next;
    let _ = key.selector.set_interest(ctx.fd, Interest::WRITABLE);
    states::WRITE
}

// ---- WRITE ----

fn write_arrival(_prev: u8, ctx: &mut SessionCtx, key: &Key) -> u8 {
    let _ = key.selector.set_interest(ctx.fd, Interest::WRITABLE);
    states::WRITE
}

fn write_on_write(ctx: &mut SessionCtx, key: &Key) -> u8 {
    match drain(ctx.fd, &mut ctx.buf_out) {
        Drain::WouldBlock | Drain::Partial => states::WRITE,
        Drain::Err => states::ERROR,
        Drain::Complete => {
            ctx.buf_out.reset();
            ctx.next_after_write
        }
    }
}

// ---- DONE / ERROR ----

fn teardown(ctx: &mut SessionCtx, key: &Key) {
    if ctx.torn_down {
        return;
    }
    ctx.torn_down = true;
    key.selector.remove_silent(ctx.fd);
    net::close(ctx.fd);
}

fn done_arrival(_prev: u8, ctx: &mut SessionCtx, key: &Key) -> u8 {
    teardown(ctx, key);
    states::DONE
}

fn error_arrival(_prev: u8, ctx: &mut SessionCtx, key: &Key) -> u8 {
    teardown(ctx, key);
    states::ERROR
}

fn build_table() -> Vec<StateDef<SessionCtx>> {
    let mut table: Vec<StateDef<SessionCtx>> = (0..states::COUNT).map(|_| StateDef::default()).collect();

    table[states::AUTH as usize] = StateDef {
        on_arrival: Some(auth_arrival),
        on_read_ready: Some(auth_on_read),
        ..Default::default()
    };
    table[states::CMD as usize] = StateDef {
        on_arrival: Some(cmd_arrival),
        on_read_ready: Some(cmd_on_read),
        ..Default::default()
    };
    table[states::WRITE as usize] = StateDef {
        on_arrival: Some(write_arrival),
        on_write_ready: Some(write_on_write),
        ..Default::default()
    };
    table[states::DONE as usize] = StateDef {
        on_arrival: Some(done_arrival),
        ..Default::default()
    };
    table[states::ERROR as usize] = StateDef {
        on_arrival: Some(error_arrival),
        ..Default::default()
    };

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_line_waits_for_crlf() {
        assert!(find_line(b"STATS").is_none());
        let (line, consumed) = find_line(b"STATS\r\nextra").unwrap();
        assert_eq!(line, "STATS");
        assert_eq!(consumed, 7);
    }

    #[test]
    fn dispatch_unknown_command() {
        let shared = Rc::new(SharedCtx {
            users: Rc::new(Users::new()),
            metrics: Rc::new(Metrics::new()),
            selector_handle: Selector::new(4).unwrap().handle(),
        });
        let ctx = SessionCtx {
            shared,
            self_ref: Weak::new(),
            fd: -1,
            buf_in: Buffer::with_capacity(16),
            buf_out: Buffer::with_capacity(16),
            authenticated: true,
            next_after_write: states::CMD,
            torn_down: false,
        };
        let (resp, next) = dispatch(&ctx, "BOGUS");
        assert!(resp.starts_with("-ERR"));
        assert_eq!(next, states::CMD);
    }

    #[test]
    fn dispatch_adduser_then_users() {
        let shared = Rc::new(SharedCtx {
            users: Rc::new(Users::new()),
            metrics: Rc::new(Metrics::new()),
            selector_handle: Selector::new(4).unwrap().handle(),
        });
        let ctx = SessionCtx {
            shared,
            self_ref: Weak::new(),
            fd: -1,
            buf_in: Buffer::with_capacity(16),
            buf_out: Buffer::with_capacity(16),
            authenticated: true,
            next_after_write: states::CMD,
            torn_down: false,
        };
        let (resp, _) = dispatch(&ctx, "ADDUSER alice hunter2");
        assert!(resp.starts_with("+OK"));
        let (resp, _) = dispatch(&ctx, "USERS");
        assert_eq!(resp, "+OK alice");
    }

    #[test]
    fn dispatch_quit_transitions_done() {
        let shared = Rc::new(SharedCtx {
            users: Rc::new(Users::new()),
            metrics: Rc::new(Metrics::new()),
            selector_handle: Selector::new(4).unwrap().handle(),
        });
        let ctx = SessionCtx {
            shared,
            self_ref: Weak::new(),
            fd: -1,
            buf_in: Buffer::with_capacity(16),
            buf_out: Buffer::with_capacity(16),
            authenticated: true,
            next_after_write: states::CMD,
            torn_down: false,
        };
        let (_, next) = dispatch(&ctx, "QUIT");
        assert_eq!(next, states::DONE);
    }
}
