//! Process bootstrap: argument parsing, the two passive listeners (SOCKS
//! and management, per spec.md §6.4), and the single-threaded `select` loop
//! that drives every connection's state machine until a shutdown signal is
//! observed.

mod args;
mod buffer;
mod error;
mod logger;
mod mgmt;
mod metrics;
mod net;
mod resolver;
mod selector;
mod socks;
mod stm;
mod sys;
mod users;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::Metrics;
use net::accept;
use resolver::ResolverTable;
use selector::{Handlers, Interest, Key, Selector, Token};
use users::Users;

const LISTEN_BACKLOG: i32 = 1024;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as usize);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as usize);
    }
}

/// Accepts connections off a passive listener and hands each one to a
/// per-protocol constructor. Loops until `accept` returns `WouldBlock`,
/// since a single readiness edge can carry more than one pending
/// connection.
struct SocksAcceptor {
    shared: Rc<socks::SharedCtx>,
}

impl Handlers for SocksAcceptor {
    fn handle_read(&mut self, key: &Key) {
        loop {
            match accept(key.fd) {
                Ok(Some((fd, addr))) => {
                    if let Err(e) = socks::Connection::accept(key.selector, self.shared.clone(), fd, addr) {
                        log::warn!("failed to register accepted SOCKS connection: {}", e);
                        net::close(fd);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("accept() on SOCKS listener failed: {}", e);
                    break;
                }
            }
        }
    }
}

struct MgmtAcceptor {
    shared: Rc<mgmt::SharedCtx>,
}

impl Handlers for MgmtAcceptor {
    fn handle_read(&mut self, key: &Key) {
        loop {
            match accept(key.fd) {
                Ok(Some((fd, _addr))) => {
                    if let Err(e) = mgmt::Session::accept(key.selector, self.shared.clone(), fd) {
                        log::warn!("failed to register accepted management connection: {}", e);
                        net::close(fd);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("accept() on management listener failed: {}", e);
                    break;
                }
            }
        }
    }
}

fn register_listener(selector: &Selector, fd: RawFd, handler: Box<dyn Handlers>) -> Result<(), error::SelectorError> {
    selector.register(fd, Token(fd as usize), handler, Interest::READABLE)
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = args::parse()?;

    logger::init(args.log_level);
    install_signal_handlers();

    let users = Rc::new(Users::new());
    for spec in &args.users {
        if !users.add(&spec.user, &spec.pass) {
            log::warn!("could not seed user {:?} from command line", spec.user);
        }
    }

    let metrics = Rc::new(Metrics::new());
    let resolver = ResolverTable::new();

    let selector = Selector::new(1024)?;
    let selector_handle = selector.handle();

    let socks_shared = Rc::new(socks::SharedCtx {
        users: users.clone(),
        metrics: metrics.clone(),
        access_log: logger::AccessLog::open(args.access_log.as_deref()),
        resolver,
        selector_handle: selector_handle.clone(),
    });
    let mgmt_shared = Rc::new(mgmt::SharedCtx {
        users: users.clone(),
        metrics: metrics.clone(),
        selector_handle: selector_handle.clone(),
    });

    let socks_addr = SocketAddr::new(args.socks_addr, args.socks_port);
    let socks_fd = net::listen(socks_addr, LISTEN_BACKLOG).map_err(error::ResourceError::Socket)?;
    register_listener(&selector, socks_fd, Box::new(SocksAcceptor { shared: socks_shared }))?;
    log::info!("SOCKS5 proxy listening on {}", socks_addr);

    let mgmt_addr = SocketAddr::new(args.mgmt_addr, args.mgmt_port);
    let mgmt_fd = net::listen(mgmt_addr, LISTEN_BACKLOG).map_err(error::ResourceError::Socket)?;
    register_listener(&selector, mgmt_fd, Box::new(MgmtAcceptor { shared: mgmt_shared }))?;
    log::info!("management interface listening on {}", mgmt_addr);

    while !SHUTDOWN.load(Ordering::SeqCst) {
        if let Err(e) = selector.select() {
            log::error!("selector error: {}", e);
        }
    }

    log::info!("shutdown signal received, exiting");
    net::close(socks_fd);
    net::close(mgmt_fd);
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("socks5-proxy: {}", e);
        std::process::exit(1);
    }
}
