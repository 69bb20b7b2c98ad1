//! The SOCKS connection engine: per-connection state, the eleven-state
//! table of §4.5, and the glue tying it to the selector.

use std::cell::RefCell;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::logger::AccessLog;
use crate::metrics::Metrics;
use crate::net;
use crate::resolver::{ResolveOutcome, ResolverTable};
use crate::selector::{Handlers, Interest, Key, Selector, SelectorHandle, Token};
use crate::stm::{StateDef, Stm};
use crate::users::Users;

use super::connect;
use super::states;
use super::wire::{self, ParseOutcome};
use crate::buffer::Buffer;

const BUFFER_CAPACITY: usize = 4096;

/// Everything a connection needs that outlives any single connection:
/// the credential store, metrics, access log and resolver, plus a handle
/// back into the selector for cross-thread wakeups.
pub struct SharedCtx {
    pub users: Rc<Users>,
    pub metrics: Rc<Metrics>,
    pub access_log: AccessLog,
    pub resolver: ResolverTable,
    pub selector_handle: SelectorHandle,
}

/// Per-connection scratch, mutated only by the event thread — see §5.
pub struct ConnCtx {
    pub shared: Rc<SharedCtx>,
    self_ref: Weak<RefCell<Connection>>,

    pub client_fd: RawFd,
    pub client_addr: SocketAddr,
    pub origin_fd: Option<RawFd>,

    buf_in: Buffer,  // client -> origin
    buf_out: Buffer, // origin -> client

    pub username: Option<String>,
    pub target_host: Option<String>,
    pub target_port: u16,

    addresses: Vec<SocketAddr>,
    addr_cursor: usize,
    any_candidate_reached: bool,

    job_id: Option<u64>,

    next_after_write: u8,

    shutdown_read_client: bool,
    shutdown_write_client: bool,
    shutdown_read_origin: bool,
    shutdown_write_origin: bool,

    bytes_sent: u64,
    bytes_recv: u64,

    torn_down: bool,
}

impl ConnCtx {
    fn new(shared: Rc<SharedCtx>, client_fd: RawFd, client_addr: SocketAddr) -> ConnCtx {
        ConnCtx {
            shared,
            self_ref: Weak::new(),
            client_fd,
            client_addr,
            origin_fd: None,
            buf_in: Buffer::with_capacity(BUFFER_CAPACITY),
            buf_out: Buffer::with_capacity(BUFFER_CAPACITY),
            username: None,
            target_host: None,
            target_port: 0,
            addresses: Vec::new(),
            addr_cursor: 0,
            any_candidate_reached: false,
            job_id: None,
            next_after_write: states::ERROR,
            shutdown_read_client: false,
            shutdown_write_client: false,
            shutdown_read_origin: false,
            shutdown_write_origin: false,
            bytes_sent: 0,
            bytes_recv: 0,
            torn_down: false,
        }
    }
}

pub struct Connection {
    stm: Stm<ConnCtx>,
    ctx: ConnCtx,
}

impl Connection {
    /// Creates the connection record and registers its client fd with the
    /// selector, then runs the initial state's arrival. Returns the shared
    /// handle the caller should retain only if it wants to watch the
    /// connection close; the engine itself does not need the caller to keep
    /// a reference alive.
    pub fn accept(
        selector: &Selector,
        shared: Rc<SharedCtx>,
        client_fd: RawFd,
        client_addr: SocketAddr,
    ) -> Result<Rc<RefCell<Connection>>, crate::error::SelectorError> {
        let ctx = ConnCtx::new(shared, client_fd, client_addr);
        ctx.shared.metrics.connection_opened();
        let conn = Rc::new(RefCell::new(Connection {
            stm: Stm::new(build_table(), states::HELLO_READ),
            ctx,
        }));
        conn.borrow_mut().ctx.self_ref = Rc::downgrade(&conn);

        let handler: Box<dyn Handlers> = Box::new(ConnHandler(conn.clone()));
        selector.register(client_fd, Token(client_fd as usize), handler, Interest::READABLE)?;

        {
            let mut c = conn.borrow_mut();
            let key = Key {
                selector,
                fd: client_fd,
                token: Token(client_fd as usize),
            };
            let Connection { stm, ctx } = &mut *c;
            stm.start(ctx, &key);
        }

        Ok(conn)
    }

    pub fn state(&self) -> u8 {
        self.stm.state()
    }
}

/// Forwards selector callbacks for one fd into the shared state machine.
/// Both the client fd and (once connecting begins) the origin fd are
/// registered with their own `ConnHandler` wrapping the same `Rc`.
pub struct ConnHandler(Rc<RefCell<Connection>>);

impl Handlers for ConnHandler {
    fn handle_read(&mut self, key: &Key) {
        let mut conn = self.0.borrow_mut();
        let Connection { stm, ctx } = &mut *conn;
        stm.handle_read(ctx, key);
    }

    fn handle_write(&mut self, key: &Key) {
        let mut conn = self.0.borrow_mut();
        let Connection { stm, ctx } = &mut *conn;
        stm.handle_write(ctx, key);
    }

    fn handle_block(&mut self, key: &Key) {
        let mut conn = self.0.borrow_mut();
        let Connection { stm, ctx } = &mut *conn;
        stm.handle_block(ctx, key);
    }

    fn handle_close(&mut self, key: &Key) {
        let mut conn = self.0.borrow_mut();
        let Connection { stm, ctx } = &mut *conn;
        if stm.state() != states::DONE && stm.state() != states::ERROR {
            stm.force(states::ERROR, ctx, key);
        }
    }
}

fn write_reply(buf: &mut Buffer, bytes: &[u8]) {
    buf.reset();
    for &b in bytes {
        let ok = buf.write_one(b);
        debug_assert!(ok, "reply longer than buffer capacity");
    }
}

fn scrub(mut s: String) {
    unsafe {
        for b in s.as_bytes_mut() {
            *b = 0;
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

fn fail_with_reply(ctx: &mut ConnCtx, code: u8) -> u8 {
    write_reply(&mut ctx.buf_out, &wire::encode_request_reply(code));
    ctx.next_after_write = states::ERROR;
    states::REQUEST_WRITE
}

// ---- HELLO_READ ----

fn hello_read_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    ctx.buf_in.reset();
    let _ = key.selector.set_interest(ctx.client_fd, Interest::READABLE);
    states::HELLO_READ
}

fn hello_read_on_read(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    match fill(ctx.client_fd, &mut ctx.buf_in) {
        Fill::WouldBlock => return states::HELLO_READ,
        Fill::Eof => return states::ERROR,
        Fill::Some => {}
    }
    match wire::parse_greeting(ctx.buf_in.read_slice()) {
        ParseOutcome::Incomplete => states::HELLO_READ,
        ParseOutcome::Invalid => states::ERROR,
        ParseOutcome::Complete { value: methods, consumed } => {
            ctx.buf_in.read_adv(consumed);
            ctx.buf_in.reset();
            let method = if methods.contains(&wire::METHOD_USERPASS) {
                wire::METHOD_USERPASS
            } else {
                wire::METHOD_NONE_ACCEPTABLE
            };
            write_reply(&mut ctx.buf_out, &wire::encode_greeting_reply(method));
            ctx.next_after_write = if method == wire::METHOD_USERPASS { states::AUTH_READ } else { states::ERROR };
            states::HELLO_WRITE
        }
    }
}

// ---- HELLO_WRITE ----

fn hello_write_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key.selector.set_interest(ctx.client_fd, Interest::WRITABLE);
    states::HELLO_WRITE
}

fn hello_write_on_write(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    match drain(ctx.client_fd, &mut ctx.buf_out) {
        Drain::WouldBlock | Drain::Partial => states::HELLO_WRITE,
        Drain::Err => states::ERROR,
        Drain::Complete => {
            ctx.buf_out.reset();
            ctx.next_after_write
        }
    }
}

// ---- AUTH_READ ----

fn auth_read_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    ctx.buf_in.reset();
    let _ = key.selector.set_interest(ctx.client_fd, Interest::READABLE);
    states::AUTH_READ
}

fn auth_read_on_read(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    match fill(ctx.client_fd, &mut ctx.buf_in) {
        Fill::WouldBlock => return states::AUTH_READ,
        Fill::Eof => return states::ERROR,
        Fill::Some => {}
    }
    match wire::parse_subnegotiation(ctx.buf_in.read_slice()) {
        ParseOutcome::Incomplete => states::AUTH_READ,
        ParseOutcome::Invalid => states::ERROR,
        ParseOutcome::Complete { value: (user, pass), consumed } => {
            ctx.buf_in.read_adv(consumed);
            ctx.buf_in.reset();
            let ok = ctx.shared.users.verify(&user, &pass);
            scrub(pass);
            if ok {
                ctx.username = Some(user);
            }
            let status = if ok { wire::AUTH_SUCCESS } else { wire::AUTH_FAILURE };
            write_reply(&mut ctx.buf_out, &wire::encode_subnegotiation_reply(status));
            ctx.next_after_write = if ok { states::REQUEST_READ } else { states::ERROR };
            states::AUTH_WRITE
        }
    }
}

// ---- AUTH_WRITE ----

fn auth_write_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key.selector.set_interest(ctx.client_fd, Interest::WRITABLE);
    states::AUTH_WRITE
}

fn auth_write_on_write(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    match drain(ctx.client_fd, &mut ctx.buf_out) {
        Drain::WouldBlock | Drain::Partial => states::AUTH_WRITE,
        Drain::Err => states::ERROR,
        Drain::Complete => {
            ctx.buf_out.reset();
            ctx.next_after_write
        }
    }
}

// ---- REQUEST_READ ----

fn request_read_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    ctx.buf_in.reset();
    let _ = key.selector.set_interest(ctx.client_fd, Interest::READABLE);
    states::REQUEST_READ
}

fn request_read_on_read(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    match fill(ctx.client_fd, &mut ctx.buf_in) {
        Fill::WouldBlock => return states::REQUEST_READ,
        Fill::Eof => return states::ERROR,
        Fill::Some => {}
    }
    match wire::parse_request(ctx.buf_in.read_slice()) {
        ParseOutcome::Incomplete => states::REQUEST_READ,
        ParseOutcome::Invalid => fail_with_reply(ctx, wire::REP_ATYP_NOT_SUPPORTED),
        ParseOutcome::Complete { value: req, consumed } => {
            ctx.buf_in.read_adv(consumed);
            ctx.buf_in.reset();
            if req.cmd != wire::CMD_CONNECT {
                return fail_with_reply(ctx, wire::REP_CMD_NOT_SUPPORTED);
            }
            ctx.target_port = req.port;
            match req.host {
                wire::Host::Ipv4(a) => {
                    ctx.target_host = None;
                    ctx.addresses = vec![SocketAddr::new(Ipv4Addr::from(a).into(), req.port)];
                    ctx.addr_cursor = 0;
                    states::REQUEST_CONNECTING
                }
                wire::Host::Ipv6(a) => {
                    ctx.target_host = None;
                    ctx.addresses = vec![SocketAddr::new(Ipv6Addr::from(a).into(), req.port)];
                    ctx.addr_cursor = 0;
                    states::REQUEST_CONNECTING
                }
                wire::Host::Domain(d) => {
                    ctx.target_host = Some(d);
                    states::REQUEST_RESOLVING
                }
            }
        }
    }
}

// ---- REQUEST_RESOLVING ----

fn resolving_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key.selector.set_interest(ctx.client_fd, Interest::NONE);
    let host = ctx.target_host.clone().unwrap_or_default();
    let job = ctx
        .shared
        .resolver
        .spawn(host, ctx.target_port, ctx.shared.selector_handle.clone(), ctx.client_fd);
    ctx.job_id = Some(job);
    states::REQUEST_RESOLVING
}

fn resolving_on_block(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    let job_id = match ctx.job_id.take() {
        Some(j) => j,
        None => return states::REQUEST_RESOLVING,
    };
    match ctx.shared.resolver.take(job_id) {
        Some(ResolveOutcome::Addresses(addrs)) if !addrs.is_empty() => {
            ctx.addresses = addrs;
            ctx.addr_cursor = 0;
            states::REQUEST_CONNECTING
        }
        _ => fail_with_reply(ctx, wire::REP_HOST_UNREACHABLE),
    }
}

// ---- REQUEST_CONNECTING ----

fn attempt_next_candidate(ctx: &mut ConnCtx, key: &Key) -> u8 {
    loop {
        if ctx.addr_cursor >= ctx.addresses.len() {
            let code = if ctx.any_candidate_reached {
                wire::REP_CONNECTION_REFUSED
            } else {
                wire::REP_HOST_UNREACHABLE
            };
            return fail_with_reply(ctx, code);
        }
        let addr = ctx.addresses[ctx.addr_cursor];
        ctx.addr_cursor += 1;

        let (fd, outcome) = match connect::create_and_connect(addr) {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        if let connect::ConnectResult::Failed(_) = outcome {
            connect::close(fd);
            continue;
        }

        ctx.any_candidate_reached = true;
        let handler: Box<dyn Handlers> = Box::new(ConnHandler(ctx.self_ref.upgrade().expect("connection alive during connect")));
        if key.selector.register(fd, Token(fd as usize), handler, Interest::WRITABLE).is_err() {
            connect::close(fd);
            continue;
        }
        ctx.origin_fd = Some(fd);
        let _ = key.selector.set_interest(ctx.client_fd, Interest::NONE);
        return states::REQUEST_CONNECTING;
    }
}

fn connecting_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    attempt_next_candidate(ctx, key)
}

fn connecting_on_write(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let fd = match ctx.origin_fd {
        Some(fd) if fd == key.fd => fd,
        _ => return states::REQUEST_CONNECTING,
    };
    match connect::so_error(fd) {
        Ok(0) => {
            write_reply(&mut ctx.buf_out, &wire::encode_request_reply(wire::REP_SUCCESS));
            ctx.next_after_write = states::COPY;
            let _ = key.selector.set_interest(fd, Interest::NONE);
            states::REQUEST_WRITE
        }
        _ => {
            connect::close(fd);
            key.selector.remove_silent(fd);
            ctx.origin_fd = None;
            attempt_next_candidate(ctx, key)
        }
    }
}

// ---- REQUEST_WRITE ----

fn request_write_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key.selector.set_interest(ctx.client_fd, Interest::WRITABLE);
    states::REQUEST_WRITE
}

fn request_write_on_write(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key;
    match drain(ctx.client_fd, &mut ctx.buf_out) {
        Drain::WouldBlock | Drain::Partial => states::REQUEST_WRITE,
        Drain::Err => states::ERROR,
        Drain::Complete => {
            ctx.buf_out.reset();
            ctx.next_after_write
        }
    }
}

// ---- COPY ----

fn copy_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    let _ = key.selector.set_interest(ctx.client_fd, Interest::READABLE);
    if let Some(origin) = ctx.origin_fd {
        let _ = key.selector.set_interest(origin, Interest::READABLE);
    }
    states::COPY
}

fn copy_finished(ctx: &ConnCtx) -> bool {
    ctx.shutdown_read_client && ctx.shutdown_read_origin && ctx.buf_in.is_empty() && ctx.buf_out.is_empty()
}

fn recompute_copy_interests(ctx: &mut ConnCtx, key: &Key) {
    let mut client_mask = Interest::NONE;
    if !ctx.shutdown_read_client && ctx.buf_in.can_write() > 0 {
        client_mask = client_mask | Interest::READABLE;
    }
    if ctx.buf_out.can_read() > 0 {
        client_mask = client_mask | Interest::WRITABLE;
    }
    let _ = key.selector.set_interest(ctx.client_fd, client_mask);

    if let Some(origin) = ctx.origin_fd {
        let mut origin_mask = Interest::NONE;
        if !ctx.shutdown_read_origin && ctx.buf_out.can_write() > 0 {
            origin_mask = origin_mask | Interest::READABLE;
        }
        if ctx.buf_in.can_read() > 0 {
            origin_mask = origin_mask | Interest::WRITABLE;
        }
        let _ = key.selector.set_interest(origin, origin_mask);
    }

    if ctx.shutdown_read_client && ctx.buf_in.is_empty() && !ctx.shutdown_write_origin {
        if let Some(origin) = ctx.origin_fd {
            net::shutdown(origin, libc::SHUT_WR);
        }
        ctx.shutdown_write_origin = true;
    }
    if ctx.shutdown_read_origin && ctx.buf_out.is_empty() && !ctx.shutdown_write_client {
        net::shutdown(ctx.client_fd, libc::SHUT_WR);
        ctx.shutdown_write_client = true;
    }
}

fn copy_read_from_client(ctx: &mut ConnCtx, key: &Key) -> u8 {
    match net::read(ctx.client_fd, ctx.buf_in.write_slice()) {
        Ok(Some(0)) => {
            ctx.shutdown_read_client = true;
            net::shutdown(ctx.client_fd, libc::SHUT_RD);
        }
        Ok(Some(n)) => {
            ctx.buf_in.write_adv(n);
            ctx.bytes_recv += n as u64;
            ctx.shared.metrics.add_bytes_received(n as u64);
        }
        Ok(None) => {}
        Err(_) => ctx.shutdown_read_client = true,
    }
    recompute_copy_interests(ctx, key);
    if copy_finished(ctx) {
        states::DONE
    } else {
        states::COPY
    }
}

fn copy_read_from_origin(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let Some(origin) = ctx.origin_fd else { return states::COPY };
    match net::read(origin, ctx.buf_out.write_slice()) {
        Ok(Some(0)) => {
            ctx.shutdown_read_origin = true;
            net::shutdown(origin, libc::SHUT_RD);
        }
        Ok(Some(n)) => {
            ctx.buf_out.write_adv(n);
            ctx.bytes_sent += n as u64;
            ctx.shared.metrics.add_bytes_sent(n as u64);
        }
        Ok(None) => {}
        Err(_) => ctx.shutdown_read_origin = true,
    }
    recompute_copy_interests(ctx, key);
    if copy_finished(ctx) {
        states::DONE
    } else {
        states::COPY
    }
}

fn copy_on_read(ctx: &mut ConnCtx, key: &Key) -> u8 {
    if key.fd == ctx.client_fd {
        copy_read_from_client(ctx, key)
    } else {
        copy_read_from_origin(ctx, key)
    }
}

fn copy_write_to_client(ctx: &mut ConnCtx, key: &Key) -> u8 {
    match net::write(ctx.client_fd, ctx.buf_out.read_slice()) {
        Ok(Some(n)) => {
            ctx.buf_out.read_adv(n);
            if ctx.buf_out.is_empty() {
                ctx.buf_out.reset();
            }
        }
        Ok(None) => {}
        Err(_) => {
            ctx.shutdown_write_client = true;
            if !ctx.shutdown_read_origin {
                if let Some(origin) = ctx.origin_fd {
                    net::shutdown(origin, libc::SHUT_RD);
                }
                ctx.shutdown_read_origin = true;
            }
        }
    }
    recompute_copy_interests(ctx, key);
    if copy_finished(ctx) {
        states::DONE
    } else {
        states::COPY
    }
}

fn copy_write_to_origin(ctx: &mut ConnCtx, key: &Key) -> u8 {
    let Some(origin) = ctx.origin_fd else { return states::COPY };
    match net::write(origin, ctx.buf_in.read_slice()) {
        Ok(Some(n)) => {
            ctx.buf_in.read_adv(n);
            if ctx.buf_in.is_empty() {
                ctx.buf_in.reset();
            }
        }
        Ok(None) => {}
        Err(_) => {
            ctx.shutdown_write_origin = true;
            if !ctx.shutdown_read_client {
                net::shutdown(ctx.client_fd, libc::SHUT_RD);
                ctx.shutdown_read_client = true;
            }
        }
    }
    recompute_copy_interests(ctx, key);
    if copy_finished(ctx) {
        states::DONE
    } else {
        states::COPY
    }
}

fn copy_on_write(ctx: &mut ConnCtx, key: &Key) -> u8 {
    if key.fd == ctx.client_fd {
        copy_write_to_client(ctx, key)
    } else {
        copy_write_to_origin(ctx, key)
    }
}

// ---- DONE / ERROR ----

fn teardown(ctx: &mut ConnCtx, key: &Key, success: bool) {
    if ctx.torn_down {
        return;
    }
    ctx.torn_down = true;

    if let Some(origin) = ctx.origin_fd.take() {
        key.selector.remove_silent(origin);
        net::close(origin);
    }
    key.selector.remove_silent(ctx.client_fd);
    net::close(ctx.client_fd);

    ctx.shared.metrics.connection_closed();
    if success {
        ctx.shared.metrics.connection_success();
    } else {
        ctx.shared.metrics.connection_failed();
    }

    ctx.shared.access_log.record(
        ctx.username.as_deref(),
        ctx.client_addr,
        ctx.target_host.as_deref(),
        ctx.target_port,
        if success { "OK" } else { "ERROR" },
        ctx.bytes_sent,
        ctx.bytes_recv,
    );
}

fn done_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    teardown(ctx, key, true);
    states::DONE
}

fn error_arrival(_prev: u8, ctx: &mut ConnCtx, key: &Key) -> u8 {
    teardown(ctx, key, false);
    states::ERROR
}

pub fn build_table() -> Vec<StateDef<ConnCtx>> {
    let mut table: Vec<StateDef<ConnCtx>> = (0..states::COUNT).map(|_| StateDef::default()).collect();

    table[states::HELLO_READ as usize] = StateDef {
        on_arrival: Some(hello_read_arrival),
        on_read_ready: Some(hello_read_on_read),
        ..Default::default()
    };
    table[states::HELLO_WRITE as usize] = StateDef {
        on_arrival: Some(hello_write_arrival),
        on_write_ready: Some(hello_write_on_write),
        ..Default::default()
    };
    table[states::AUTH_READ as usize] = StateDef {
        on_arrival: Some(auth_read_arrival),
        on_read_ready: Some(auth_read_on_read),
        ..Default::default()
    };
    table[states::AUTH_WRITE as usize] = StateDef {
        on_arrival: Some(auth_write_arrival),
        on_write_ready: Some(auth_write_on_write),
        ..Default::default()
    };
    table[states::REQUEST_READ as usize] = StateDef {
        on_arrival: Some(request_read_arrival),
        on_read_ready: Some(request_read_on_read),
        ..Default::default()
    };
    table[states::REQUEST_RESOLVING as usize] = StateDef {
        on_arrival: Some(resolving_arrival),
        on_block_ready: Some(resolving_on_block),
        ..Default::default()
    };
    table[states::REQUEST_CONNECTING as usize] = StateDef {
        on_arrival: Some(connecting_arrival),
        on_write_ready: Some(connecting_on_write),
        ..Default::default()
    };
    table[states::REQUEST_WRITE as usize] = StateDef {
        on_arrival: Some(request_write_arrival),
        on_write_ready: Some(request_write_on_write),
        ..Default::default()
    };
    table[states::COPY as usize] = StateDef {
        on_arrival: Some(copy_arrival),
        on_read_ready: Some(copy_on_read),
        on_write_ready: Some(copy_on_write),
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
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::IntoRawFd;

    fn test_shared() -> Rc<SharedCtx> {
        let users = Rc::new(Users::new());
        users.add("admin", "admin");
        let selector = Selector::new(4).expect("selector");
        Rc::new(SharedCtx {
            users,
            metrics: Rc::new(Metrics::new()),
            access_log: AccessLog::open(None),
            resolver: ResolverTable::new(),
            selector_handle: selector.handle(),
        })
    }

    /// A connected loopback pair: the returned `TcpStream` is the "far end"
    /// a test drives directly; the `RawFd` is handed to `ConnCtx` as the
    /// client fd, standing in for what `net::accept` would have returned.
    fn socket_pair() -> (TcpStream, RawFd, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, peer) = listener.accept().expect("accept");
        (client, server.into_raw_fd(), peer)
    }

    fn dummy_key(selector: &Selector, fd: RawFd) -> Key<'_> {
        Key {
            selector,
            fd,
            token: Token(fd as usize),
        }
    }

    #[test]
    fn hello_selects_userpass_when_offered() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        client.write_all(&[0x05, 0x01, 0x02]).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = hello_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::HELLO_WRITE);
        assert_eq!(ctx.buf_out.read_slice().to_vec(), vec![0x05, 0x02]);
        assert_eq!(ctx.next_after_write, states::AUTH_READ);
    }

    #[test]
    fn hello_rejects_when_userpass_not_offered() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        client.write_all(&[0x05, 0x01, 0x00]).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = hello_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::HELLO_WRITE);
        assert_eq!(ctx.buf_out.read_slice().to_vec(), vec![0x05, 0xFF]);
        assert_eq!(ctx.next_after_write, states::ERROR);
    }

    #[test]
    fn auth_succeeds_for_seeded_user_and_scrubs_password() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        let mut msg = vec![0x01, 5];
        msg.extend_from_slice(b"admin");
        msg.push(5);
        msg.extend_from_slice(b"admin");
        client.write_all(&msg).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = auth_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::AUTH_WRITE);
        assert_eq!(ctx.buf_out.read_slice().to_vec(), vec![0x01, 0x00]);
        assert_eq!(ctx.next_after_write, states::REQUEST_READ);
        assert_eq!(ctx.username.as_deref(), Some("admin"));
    }

    #[test]
    fn auth_fails_for_bad_password() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        let mut msg = vec![0x01, 5];
        msg.extend_from_slice(b"admin");
        msg.push(3);
        msg.extend_from_slice(b"bad");
        client.write_all(&msg).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = auth_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::AUTH_WRITE);
        assert_eq!(ctx.buf_out.read_slice().to_vec(), vec![0x01, 0x01]);
        assert_eq!(ctx.next_after_write, states::ERROR);
        assert!(ctx.username.is_none());
    }

    #[test]
    fn request_rejects_unsupported_command() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        let msg = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        client.write_all(&msg).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = request_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::REQUEST_WRITE);
        assert_eq!(
            ctx.buf_out.read_slice().to_vec(),
            wire::encode_request_reply(wire::REP_CMD_NOT_SUPPORTED).to_vec()
        );
        assert_eq!(ctx.next_after_write, states::ERROR);
    }

    #[test]
    fn request_rejects_unsupported_atyp() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        let msg = [0x05, 0x01, 0x00, 0x02, 0x00, 0x00];
        client.write_all(&msg).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = request_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::REQUEST_WRITE);
        assert_eq!(
            ctx.buf_out.read_slice().to_vec(),
            wire::encode_request_reply(wire::REP_ATYP_NOT_SUPPORTED).to_vec()
        );
    }

    #[test]
    fn request_ipv4_moves_to_connecting() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        let msg = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        client.write_all(&msg).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = request_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::REQUEST_CONNECTING);
        assert_eq!(ctx.addresses.len(), 1);
        assert_eq!(ctx.target_port, 80);
        assert!(ctx.target_host.is_none());
    }

    #[test]
    fn request_domain_moves_to_resolving() {
        let shared = test_shared();
        let (mut client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        let mut msg = vec![0x05, 0x01, 0x00, 0x03, 11];
        msg.extend_from_slice(b"example.com");
        msg.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&msg).unwrap();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);
        let next = request_read_on_read(&mut ctx, &key);

        assert_eq!(next, states::REQUEST_RESOLVING);
        assert_eq!(ctx.target_host.as_deref(), Some("example.com"));
        assert_eq!(ctx.target_port, 443);
    }

    #[test]
    fn copy_finished_requires_both_shutdown_and_drained_buffers() {
        let shared = test_shared();
        let (_client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);

        assert!(!copy_finished(&ctx));
        ctx.shutdown_read_client = true;
        assert!(!copy_finished(&ctx));
        ctx.shutdown_read_origin = true;
        assert!(copy_finished(&ctx));

        ctx.buf_in.write_one(b'x');
        assert!(!copy_finished(&ctx));
    }

    #[test]
    fn teardown_is_idempotent() {
        let shared = test_shared();
        let metrics = shared.metrics.clone();
        let (_client, fd, addr) = socket_pair();
        let mut ctx = ConnCtx::new(shared, fd, addr);
        metrics.connection_opened();

        let selector = Selector::new(4).unwrap();
        let key = dummy_key(&selector, fd);

        teardown(&mut ctx, &key, true);
        let after_first = metrics.snapshot().current_connections;
        teardown(&mut ctx, &key, true);
        let after_second = metrics.snapshot().current_connections;

        assert_eq!(after_first, 0);
        assert_eq!(after_first, after_second);
        assert_eq!(metrics.snapshot().successful_connections, 1);
    }
}
