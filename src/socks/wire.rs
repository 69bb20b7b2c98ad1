//! RFC 1928 greeting/request/reply and RFC 1929 subnegotiation wire forms.
//!
//! Every parser here is a pure function over an immutable slice: it never
//! mutates a cursor itself. Callers only advance the owning buffer's read
//! cursor on [`ParseOutcome::Complete`], which is what gives the engine its
//! cursor-safety guarantee across partial reads.

pub const VERSION: u8 = 0x05;
pub const METHOD_USERPASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const AUTH_VERSION: u8 = 0x01;
pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// The outcome of attempting to parse one wire message out of a byte slice.
pub enum ParseOutcome<T> {
    /// Not enough bytes yet; the caller must not advance its read cursor.
    Incomplete,
    /// The bytes present are well-formed for some other version/field but
    /// violate a protocol invariant this engine requires.
    Invalid,
    /// `consumed` bytes make up one complete message; the caller advances
    /// its read cursor by exactly that many.
    Complete { value: T, consumed: usize },
}

/// Destination address as carried in a SOCKS request, before resolution.
#[derive(Debug, Clone)]
pub enum Host {
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
    Domain(String),
}

pub struct Request {
    pub cmd: u8,
    pub atyp: u8,
    pub host: Host,
    pub port: u16,
}

/// `VER(1) NMETHODS(1) METHODS(NMETHODS)`.
pub fn parse_greeting(buf: &[u8]) -> ParseOutcome<Vec<u8>> {
    if buf.len() < 2 {
        return ParseOutcome::Incomplete;
    }
    if buf[0] != VERSION {
        return ParseOutcome::Invalid;
    }
    let nmethods = buf[1] as usize;
    let need = 2 + nmethods;
    if buf.len() < need {
        return ParseOutcome::Incomplete;
    }
    ParseOutcome::Complete {
        value: buf[2..need].to_vec(),
        consumed: need,
    }
}

pub fn encode_greeting_reply(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// `VER(1=0x01) ULEN(1) UNAME(ULEN) PLEN(1) PASSWD(PLEN)`.
pub fn parse_subnegotiation(buf: &[u8]) -> ParseOutcome<(String, String)> {
    if buf.is_empty() {
        return ParseOutcome::Incomplete;
    }
    if buf[0] != AUTH_VERSION {
        return ParseOutcome::Invalid;
    }
    if buf.len() < 2 {
        return ParseOutcome::Incomplete;
    }
    let ulen = buf[1] as usize;
    let after_user = 2 + ulen;
    if buf.len() < after_user + 1 {
        return ParseOutcome::Incomplete;
    }
    let plen = buf[after_user] as usize;
    let need = after_user + 1 + plen;
    if buf.len() < need {
        return ParseOutcome::Incomplete;
    }
    let username = match String::from_utf8(buf[2..after_user].to_vec()) {
        Ok(s) => s,
        Err(_) => return ParseOutcome::Invalid,
    };
    let password = match String::from_utf8(buf[after_user + 1..need].to_vec()) {
        Ok(s) => s,
        Err(_) => return ParseOutcome::Invalid,
    };
    ParseOutcome::Complete {
        value: (username, password),
        consumed: need,
    }
}

pub fn encode_subnegotiation_reply(status: u8) -> [u8; 2] {
    [AUTH_VERSION, status]
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`.
pub fn parse_request(buf: &[u8]) -> ParseOutcome<Request> {
    if buf.len() < 4 {
        return ParseOutcome::Incomplete;
    }
    if buf[0] != VERSION {
        return ParseOutcome::Invalid;
    }
    let cmd = buf[1];
    let atyp = buf[3];

    let (host, addr_len) = match atyp {
        ATYP_IPV4 => (4usize, 4usize),
        ATYP_IPV6 => (16usize, 16usize),
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return ParseOutcome::Incomplete;
            }
            let dlen = buf[4] as usize;
            (dlen + 1, dlen)
        }
        _ => return ParseOutcome::Invalid,
    };
    let _ = addr_len;

    let need = 4 + host + 2;
    if buf.len() < need {
        return ParseOutcome::Incomplete;
    }

    let host_value = match atyp {
        ATYP_IPV4 => {
            let mut a = [0u8; 4];
            a.copy_from_slice(&buf[4..8]);
            Host::Ipv4(a)
        }
        ATYP_IPV6 => {
            let mut a = [0u8; 16];
            a.copy_from_slice(&buf[4..20]);
            Host::Ipv6(a)
        }
        ATYP_DOMAIN => {
            let dlen = buf[4] as usize;
            match String::from_utf8(buf[5..5 + dlen].to_vec()) {
                Ok(s) => Host::Domain(s),
                Err(_) => return ParseOutcome::Invalid,
            }
        }
        _ => unreachable!(),
    };

    let port = u16::from_be_bytes([buf[need - 2], buf[need - 1]]);

    ParseOutcome::Complete {
        value: Request {
            cmd,
            atyp,
            host: host_value,
            port,
        },
        consumed: need,
    }
}

/// `VER REP RSV ATYP BND.ADDR(=0.0.0.0) BND.PORT(=0)`, per §4.5.6: the true
/// local binding is never reported.
pub fn encode_request_reply(rep: u8) -> [u8; 10] {
    [VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_incomplete_then_complete() {
        let full = [0x05, 0x02, 0x00, 0x02];
        assert!(matches!(parse_greeting(&full[..1]), ParseOutcome::Incomplete));
        assert!(matches!(parse_greeting(&full[..3]), ParseOutcome::Incomplete));
        match parse_greeting(&full) {
            ParseOutcome::Complete { value, consumed } => {
                assert_eq!(value, vec![0x00, 0x02]);
                assert_eq!(consumed, 4);
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn greeting_rejects_bad_version() {
        assert!(matches!(parse_greeting(&[0x04, 0x00]), ParseOutcome::Invalid));
    }

    #[test]
    fn subnegotiation_round_trip() {
        let mut msg = vec![0x01, 5];
        msg.extend_from_slice(b"admin");
        msg.push(5);
        msg.extend_from_slice(b"admin");
        assert!(matches!(parse_subnegotiation(&msg[..3]), ParseOutcome::Incomplete));
        match parse_subnegotiation(&msg) {
            ParseOutcome::Complete { value, consumed } => {
                assert_eq!(value.0, "admin");
                assert_eq!(value.1, "admin");
                assert_eq!(consumed, msg.len());
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn request_ipv4_parses() {
        let msg = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        match parse_request(&msg) {
            ParseOutcome::Complete { value, consumed } => {
                assert_eq!(consumed, 10);
                assert_eq!(value.cmd, CMD_CONNECT);
                assert_eq!(value.port, 80);
                match value.host {
                    Host::Ipv4(a) => assert_eq!(a, [127, 0, 0, 1]),
                    _ => panic!("expected ipv4"),
                }
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn request_domain_parses() {
        let mut msg = vec![0x05, 0x01, 0x00, 0x03, 11];
        msg.extend_from_slice(b"example.com");
        msg.extend_from_slice(&443u16.to_be_bytes());
        match parse_request(&msg) {
            ParseOutcome::Complete { value, .. } => match value.host {
                Host::Domain(d) => assert_eq!(d, "example.com"),
                _ => panic!("expected domain"),
            },
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn request_unsupported_atyp_is_invalid() {
        let msg = [0x05, 0x01, 0x00, 0x02, 0, 0];
        assert!(matches!(parse_request(&msg), ParseOutcome::Invalid));
    }
}
