//! Connectivity probing: resolve a URL's host to an address bound to a
//! specific interface, then fetch it over HTTP(S) through that same
//! interface, checking for an expected payload substring.
//!
//! Grounded on `connection_checker.py` (IP-cache-then-resolve algorithm,
//! `curl_get`'s `Host:` header substitution) and `dns_resolver.py`
//! (`SO_BINDTODEVICE` socket factory). Neither a high-level DNS resolver
//! crate nor `hyper`'s client exposes per-request interface binding, so both
//! legs are hand-rolled on top of `std::net` + `libc`, run inside
//! `spawn_blocking` since they're synchronous.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::errors::FailoverError;

/// Connect-and-total timeout for one candidate IP.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const DNS_TIMEOUT: Duration = Duration::from_secs(2);
/// A well-known, non-vendor-specific public DNS resolver. The original used
/// the system resolver's configured servers; binding to an interface only
/// helps if we pick a server reachable on that path, so a public anycast
/// resolver is used deterministically instead of depending on
/// `/etc/resolv.conf` parsing, which is out of scope for the core.
const DNS_SERVER: (Ipv4Addr, u16) = (Ipv4Addr::new(1, 1, 1, 1), 53);

pub struct Prober {
    last_ip: Mutex<HashMap<String, IpAddr>>,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober {
    pub fn new() -> Self {
        Prober {
            last_ip: Mutex::new(HashMap::new()),
        }
    }

    /// Checks connectivity over `iface` by resolving the cached IP first,
    /// then re-resolving the host if that fails, then trying every
    /// resolved address in turn — run on a blocking thread since the
    /// sockets involved are synchronous. `iface`, `url` and `expected` are
    /// cheap to clone into the blocking closure.
    pub async fn check(&self, iface: &str, url: &str, expected: &str) -> bool {
        let cached = self.last_ip.lock().unwrap().get(url).copied();
        if let Some(ip) = cached {
            let iface = iface.to_string();
            let url2 = url.to_string();
            let expected2 = expected.to_string();
            let ok = tokio::task::spawn_blocking(move || fetch(&iface, &url2, ip, &expected2))
                .await
                .unwrap_or(false);
            if ok {
                return true;
            }
        }

        let host = host_of(url);
        let iface_owned = iface.to_string();
        let host_owned = host.clone();
        let addrs = match tokio::task::spawn_blocking(move || resolve_a(&iface_owned, &host_owned))
            .await
        {
            Ok(Ok(addrs)) => addrs,
            _ => return false,
        };

        for addr in addrs {
            let iface = iface.to_string();
            let url2 = url.to_string();
            let expected2 = expected.to_string();
            let ok =
                tokio::task::spawn_blocking(move || fetch(&iface, &url2, IpAddr::V4(addr), &expected2))
                    .await
                    .unwrap_or(false);
            if ok {
                self.last_ip
                    .lock()
                    .unwrap()
                    .insert(url.to_string(), IpAddr::V4(addr));
                return true;
            }
        }
        false
    }
}

/// Extracts the hostname component of `url`, falling back to the whole
/// string if it doesn't parse as `scheme://host[:port]/...` — mirrors
/// `get_host_name`'s "return the input unchanged" fallback.
fn host_of(url: &str) -> String {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.split(':').next().unwrap_or(authority).to_string()
}

fn uses_tls(url: &str) -> bool {
    url.starts_with("https://")
}

fn port_of(url: &str, default: u16) -> u16 {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority
        .rsplitn(2, ':')
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|_| authority.contains(':'))
        .unwrap_or(default)
}

fn path_of(url: &str) -> String {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    match without_scheme.find('/') {
        Some(idx) => without_scheme[idx..].to_string(),
        None => "/".to_string(),
    }
}

/// Binds a freshly-created socket fd to `iface` via `SO_BINDTODEVICE`
/// (Linux-only, requires `CAP_NET_RAW` or root — matches the daemon's usual
/// privilege level).
fn bind_to_device(fd: std::os::unix::io::RawFd, iface: &str) -> std::io::Result<()> {
    let mut name = iface.as_bytes().to_vec();
    name.push(0);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn resolve_a(iface: &str, host: &str) -> Result<Vec<Ipv4Addr>, FailoverError> {
    use std::os::unix::io::AsRawFd;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    bind_to_device(socket.as_raw_fd(), iface)
        .map_err(|e| FailoverError::Transport(format!("bind {} to {}: {}", host, iface, e)))?;
    socket.set_read_timeout(Some(DNS_TIMEOUT))?;
    socket.set_write_timeout(Some(DNS_TIMEOUT))?;

    let query = build_a_query(host);
    let server = SocketAddr::from(DNS_SERVER);
    socket.send_to(&query, server)?;

    let mut buf = [0u8; 512];
    let (n, _) = socket
        .recv_from(&mut buf)
        .map_err(|e| FailoverError::Transport(format!("DNS query for {}: {}", host, e)))?;
    parse_a_response(&buf[..n])
        .ok_or_else(|| FailoverError::Transport(format!("no A records for {}", host)))
}

/// Builds a minimal single-question A-record DNS query. Transaction ID is
/// fixed (no concurrent queries share a socket) rather than random, since
/// `rand` isn't otherwise a dependency of this crate.
fn build_a_query(host: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + host.len());
    msg.extend_from_slice(&[0x13, 0x37]); // transaction id
    msg.extend_from_slice(&[0x01, 0x00]); // flags: recursion desired
    msg.extend_from_slice(&[0x00, 0x01]); // qdcount
    msg.extend_from_slice(&[0x00, 0x00]); // ancount
    msg.extend_from_slice(&[0x00, 0x00]); // nscount
    msg.extend_from_slice(&[0x00, 0x00]); // arcount
    for label in host.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0); // root label
    msg.extend_from_slice(&[0x00, 0x01]); // QTYPE A
    msg.extend_from_slice(&[0x00, 0x01]); // QCLASS IN
    msg
}

/// Walks a DNS response for A-record (type 1, class 1) answers, skipping the
/// echoed question section. Returns `None` if the packet is malformed or has
/// no A answers.
fn parse_a_response(buf: &[u8]) -> Option<Vec<Ipv4Addr>> {
    if buf.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    let mut pos = 12;

    for _ in 0..qdcount {
        pos = skip_name(buf, pos)?;
        pos += 4; // qtype + qclass
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(buf, pos)?;
        if pos + 10 > buf.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let rdlength = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > buf.len() {
            return None;
        }
        if rtype == 1 && rdlength == 4 {
            addrs.push(Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]));
        }
        pos += rdlength;
    }
    if addrs.is_empty() {
        None
    } else {
        Some(addrs)
    }
}

/// Skips a (possibly compressed) DNS name starting at `pos`, returning the
/// offset just past it.
fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // compression pointer: two bytes, doesn't recurse further here
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
        if pos >= buf.len() {
            return None;
        }
    }
}

/// Opens a TCP connection to `ip:port` (bound to `iface`), issues a minimal
/// HTTP/1.1 GET with `Host: <original hostname>`, and returns whether the
/// expected payload substring appears in the response body. TLS is layered
/// with `native_tls` when the URL scheme is `https`.
fn fetch(iface: &str, url: &str, ip: IpAddr, expected: &str) -> bool {
    let tls = uses_tls(url);
    let port = port_of(url, if tls { 443 } else { 80 });
    let host = host_of(url);
    let path = path_of(url);
    let deadline = Instant::now() + PROBE_TIMEOUT;
    connect_bound(iface, ip, port, tls, &host, &path, expected, deadline)
}

#[allow(clippy::too_many_arguments)]
fn connect_bound(
    iface: &str,
    ip: IpAddr,
    port: u16,
    tls: bool,
    host: &str,
    path: &str,
    expected: &str,
    deadline: Instant,
) -> bool {
    use std::os::unix::io::{AsRawFd, FromRawFd};

    let domain = match ip {
        IpAddr::V4(_) => libc::AF_INET,
        IpAddr::V6(_) => libc::AF_INET6,
    };
    let raw_fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if raw_fd < 0 {
        return false;
    }
    if bind_to_device(raw_fd, iface).is_err() {
        unsafe { libc::close(raw_fd) };
        return false;
    }

    let stream = unsafe { TcpStream::from_raw_fd(raw_fd) };
    let addr = SocketAddr::new(ip, port);
    let sockaddr = socket_addr_to_c(&addr);
    let rc = unsafe {
        libc::connect(
            stream.as_raw_fd(),
            &sockaddr.0 as *const _ as *const libc::sockaddr,
            sockaddr.1,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return false;
        }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return false;
    }
    let _ = stream.set_read_timeout(Some(remaining));
    let _ = stream.set_write_timeout(Some(remaining));

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nUser-Agent: wan-failover-prober\r\n\r\n",
        path, host
    );

    let body = if tls {
        fetch_tls(stream, host, &request)
    } else {
        fetch_plain(stream, &request)
    };

    match body {
        Some(text) => text.contains(expected),
        None => false,
    }
}

fn fetch_plain(mut stream: TcpStream, request: &str) -> Option<String> {
    stream.write_all(request.as_bytes()).ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok();
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn fetch_tls(stream: TcpStream, host: &str, request: &str) -> Option<String> {
    let connector = native_tls::TlsConnector::new().ok()?;
    let mut tls_stream = connector.connect(host, stream).ok()?;
    tls_stream.write_all(request.as_bytes()).ok()?;
    let mut buf = Vec::new();
    tls_stream.read_to_end(&mut buf).ok();
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn socket_addr_to_c(addr: &SocketAddr) -> (libc::sockaddr_in, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            (sa, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(_) => {
            // IPv6 candidates never come out of `resolve_a` (A-record only),
            // so this arm is unreachable in practice; return a zeroed
            // struct rather than panicking.
            (unsafe { std::mem::zeroed() }, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_extracts_hostname() {
        assert_eq!(host_of("http://example.com/status"), "example.com");
        assert_eq!(host_of("https://example.com:8443/x"), "example.com");
        assert_eq!(host_of("not-a-url"), "not-a-url");
    }

    #[test]
    fn port_of_defaults_by_scheme() {
        assert_eq!(port_of("http://example.com/", 80), 80);
        assert_eq!(port_of("https://example.com/", 443), 443);
        assert_eq!(port_of("http://example.com:8080/", 80), 8080);
    }

    #[test]
    fn path_of_defaults_to_root() {
        assert_eq!(path_of("http://example.com"), "/");
        assert_eq!(path_of("http://example.com/a/b"), "/a/b");
    }

    #[test]
    fn dns_query_roundtrip_parses_a_record() {
        let query = build_a_query("example.com");
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        let mut response = query.clone();
        response[2] = 0x81;
        response[3] = 0x80;
        response[7] = 0x01; // ancount = 1
        response.extend_from_slice(&[0xC0, 0x0C]); // name ptr to question
        response.extend_from_slice(&[0x00, 0x01]); // type A
        response.extend_from_slice(&[0x00, 0x01]); // class IN
        response.extend_from_slice(&[0x00, 0x00, 0x00, 0x3C]); // ttl
        response.extend_from_slice(&[0x00, 0x04]); // rdlength
        response.extend_from_slice(&[93, 184, 216, 34]); // example.com A
        let addrs = parse_a_response(&response).unwrap();
        assert_eq!(addrs, vec![Ipv4Addr::new(93, 184, 216, 34)]);
    }
}
