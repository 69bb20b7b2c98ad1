//! Leveled diagnostic logging plus a dedicated access-log sink.
//!
//! Grounded in the reference `logger.c`: two independent facilities sharing
//! only a timestamp format. Leveled messages (`log::debug!`/`info!`/...) go
//! through the `log` facade to whatever level threshold the operator chose;
//! the access log is a separate, always-on sink that records one line per
//! terminated connection regardless of that threshold, matching the
//! reference's `log_access` writing unconditionally.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::Path;

use chrono::Local;
use log::LevelFilter;
use parking_lot::Mutex;
use simple_logger::SimpleLogger;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Initializes the leveled `log` facade. Call once at process start.
pub fn init(level: LevelFilter) {
    SimpleLogger::new()
        .with_level(level)
        .init()
        .expect("logger already initialized");
}

enum Sink {
    File(File),
    Stderr,
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::File(f) => f.write(buf),
            Sink::Stderr => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File(f) => f.flush(),
            Sink::Stderr => io::stderr().flush(),
        }
    }
}

/// One line per terminated connection, independent of the leveled logger's
/// threshold.
pub struct AccessLog {
    sink: Mutex<Sink>,
}

impl AccessLog {
    /// `path: None` writes to stderr. A path that cannot be opened for
    /// append falls back to stderr, matching the reference's behavior on a
    /// failed `fopen`.
    pub fn open(path: Option<&Path>) -> AccessLog {
        let sink = match path {
            None => Sink::Stderr,
            Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Sink::File(f),
                Err(e) => {
                    log::warn!("could not open access log {}: {}, using stderr", path.display(), e);
                    Sink::Stderr
                }
            },
        };
        AccessLog { sink: Mutex::new(sink) }
    }

    /// Writes `[timestamp] ACCESS <user>@<client> -> <target>:<port> <status> <sent>/<recv>`.
    /// `user` is `-` when no auth completed; `target_host` is `-` for
    /// connections that failed before request parsing.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        user: Option<&str>,
        client_addr: SocketAddr,
        target_host: Option<&str>,
        target_port: u16,
        status: &str,
        bytes_sent: u64,
        bytes_recv: u64,
    ) {
        let now = Local::now().format(TIMESTAMP_FMT);
        let line = format!(
            "[{}] ACCESS {}@{} -> {}:{} {} {}/{}\n",
            now,
            user.unwrap_or("-"),
            client_addr,
            target_host.unwrap_or("-"),
            target_port,
            status,
            bytes_sent,
            bytes_recv,
        );
        let mut sink = self.sink.lock();
        let _ = sink.write_all(line.as_bytes());
        let _ = sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn record_formats_expected_line() {
        let dir = std::env::temp_dir().join(format!("socks5-proxy-test-{}", std::process::id()));
        let access = AccessLog::open(Some(&dir));
        let addr = SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 54321);
        access.record(Some("alice"), addr, Some("example.com"), 443, "OK", 100, 200);
        access.record(None, addr, None, 0, "AUTH_FAILED", 0, 0);

        let contents = std::fs::read_to_string(&dir).unwrap();
        assert!(contents.contains("ACCESS alice@127.0.0.1:54321 -> example.com:443 OK 100/200"));
        assert!(contents.contains("ACCESS -@127.0.0.1:54321 -> -:0 AUTH_FAILED 0/0"));
        let _ = std::fs::remove_file(&dir);
    }
}
