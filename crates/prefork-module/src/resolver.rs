//! Built-in async requests: name resolution.
//!
//! Both requests are plain data carried in `AsyncEvent::request`. The
//! matching handlers run on a pool thread, call the blocking system
//! resolver and write their output back into the request.
//!
//! Outcome convention:
//! - success: `retval = Some(0)` for `GethostbynameRequest`, `Some(n)` with
//!   the number of addresses for `GetaddrinfoRequest`
//! - failure: `retval = Some(-1)` and `error = Some(Error::Resolve(code))`
//!   where `code` is the `EAI_*` value from getaddrinfo

use prefork_core::error::Error;
use prefork_core::event::AsyncEvent;
use prefork_core::kerror;

use std::ffi::{CStr, CString};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Hostname → single address lookup
#[derive(Debug, Clone)]
pub struct GethostbynameRequest {
    pub name: String,
    /// `AF_INET` or `AF_INET6`
    pub family: i32,
    /// Textual address, filled in on success
    pub addr: Option<String>,
}

impl GethostbynameRequest {
    pub fn new(name: impl Into<String>, family: i32) -> Self {
        Self { name: name.into(), family, addr: None }
    }
}

/// Full getaddrinfo lookup
#[derive(Debug, Clone)]
pub struct GetaddrinfoRequest {
    pub hostname: String,
    pub service: Option<String>,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    /// `EAI_*` code of the last lookup, 0 on success
    pub error: i32,
    pub results: Vec<SocketAddr>,
}

impl GetaddrinfoRequest {
    pub fn new(hostname: impl Into<String>, family: i32, socktype: i32, protocol: i32, service: Option<String>) -> Self {
        Self {
            hostname: hostname.into(),
            service,
            family,
            socktype,
            protocol,
            error: 0,
            results: Vec::new(),
        }
    }

    /// Resolved addresses as strings, in resolver order
    pub fn parse_result(&self) -> Vec<String> {
        self.results.iter().map(|sa| sa.ip().to_string()).collect()
    }
}

/// Pool handler for `GethostbynameRequest`
pub fn handler_gethostbyname(event: &mut AsyncEvent) {
    let Some(req) = event.request_mut::<GethostbynameRequest>() else {
        kerror!("handler_gethostbyname: task {} carries a foreign request", event.task_id);
        event.error = Some(Error::InvalidParams("expected GethostbynameRequest"));
        event.retval = Some(-1);
        return;
    };

    let outcome = lookup(&req.name, None, req.family, libc::SOCK_STREAM, 0);
    let outcome = outcome.and_then(|addrs| addrs.first().map(|sa| sa.ip().to_string()).ok_or(libc::EAI_NONAME));
    match outcome {
        Ok(addr) => {
            req.addr = Some(addr);
            event.retval = Some(0);
        }
        Err(code) => {
            req.addr = None;
            event.error = Some(Error::Resolve(code));
            event.retval = Some(-1);
        }
    }
}

/// Pool handler for `GetaddrinfoRequest`
pub fn handler_getaddrinfo(event: &mut AsyncEvent) {
    let Some(req) = event.request_mut::<GetaddrinfoRequest>() else {
        kerror!("handler_getaddrinfo: task {} carries a foreign request", event.task_id);
        event.error = Some(Error::InvalidParams("expected GetaddrinfoRequest"));
        event.retval = Some(-1);
        return;
    };

    match lookup(&req.hostname, req.service.as_deref(), req.family, req.socktype, req.protocol) {
        Ok(addrs) => {
            req.error = 0;
            req.results = addrs;
            event.retval = Some(req.results.len() as isize);
        }
        Err(code) => {
            req.error = code;
            req.results.clear();
            event.error = Some(Error::Resolve(code));
            event.retval = Some(-1);
        }
    }
}

/// Human-readable text for an `EAI_*` code
pub fn resolve_error_str(code: i32) -> String {
    // Safety: gai_strerror returns a static string.
    unsafe { CStr::from_ptr(libc::gai_strerror(code)) }.to_string_lossy().into_owned()
}

/// Blocking getaddrinfo; `Err` carries the `EAI_*` code
fn lookup(host: &str, service: Option<&str>, family: i32, socktype: i32, protocol: i32) -> Result<Vec<SocketAddr>, i32> {
    let c_host = CString::new(host).map_err(|_| libc::EAI_NONAME)?;
    let c_service = service.map(CString::new).transpose().map_err(|_| libc::EAI_SERVICE)?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = family;
    hints.ai_socktype = socktype;
    hints.ai_protocol = protocol;

    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    let ret = unsafe {
        libc::getaddrinfo(
            c_host.as_ptr(),
            c_service.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            &hints,
            &mut res,
        )
    };
    if ret != 0 {
        return Err(ret);
    }

    let mut addrs = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        // Safety: cur walks the list getaddrinfo just returned.
        let ai = unsafe { &*cur };
        if let Some(sa) = unsafe { to_socket_addr(ai) } {
            addrs.push(sa);
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(addrs)
}

/// Safety: `ai.ai_addr` must point to a sockaddr of `ai.ai_family`.
unsafe fn to_socket_addr(ai: &libc::addrinfo) -> Option<SocketAddr> {
    if ai.ai_addr.is_null() {
        return None;
    }
    match ai.ai_family {
        libc::AF_INET => {
            let sin = &*(ai.ai_addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(ai.ai_addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gethostbyname_numeric_v4() {
        let mut ev = AsyncEvent::new(GethostbynameRequest::new("127.0.0.1", libc::AF_INET));
        handler_gethostbyname(&mut ev);
        assert_eq!(ev.retval, Some(0));
        assert!(ev.error.is_none());
        assert_eq!(ev.request::<GethostbynameRequest>().unwrap().addr.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_gethostbyname_numeric_v6() {
        let mut ev = AsyncEvent::new(GethostbynameRequest::new("::1", libc::AF_INET6));
        handler_gethostbyname(&mut ev);
        assert_eq!(ev.retval, Some(0));
        assert_eq!(ev.request::<GethostbynameRequest>().unwrap().addr.as_deref(), Some("::1"));
    }

    #[test]
    fn test_getaddrinfo_with_service() {
        let req = GetaddrinfoRequest::new("127.0.0.1", libc::AF_INET, libc::SOCK_STREAM, 0, Some("8080".into()));
        let mut ev = AsyncEvent::new(req);
        handler_getaddrinfo(&mut ev);

        let req = ev.request::<GetaddrinfoRequest>().unwrap();
        assert_eq!(req.error, 0);
        assert_eq!(ev.retval, Some(req.results.len() as isize));
        assert!(!req.results.is_empty());
        assert_eq!(req.results[0].port(), 8080);
        assert_eq!(req.parse_result()[0], "127.0.0.1");
    }

    #[test]
    fn test_getaddrinfo_bad_family() {
        let req = GetaddrinfoRequest::new("127.0.0.1", 12345, libc::SOCK_STREAM, 0, None);
        let mut ev = AsyncEvent::new(req);
        handler_getaddrinfo(&mut ev);

        assert_eq!(ev.retval, Some(-1));
        let code = ev.request::<GetaddrinfoRequest>().unwrap().error;
        assert_ne!(code, 0);
        assert_eq!(ev.error, Some(Error::Resolve(code)));
        assert!(!resolve_error_str(code).is_empty());
    }

    #[test]
    fn test_handler_rejects_foreign_request() {
        let mut ev = AsyncEvent::new(42u32);
        handler_gethostbyname(&mut ev);
        assert_eq!(ev.retval, Some(-1));
        assert!(matches!(ev.error, Some(Error::InvalidParams(_))));
    }
}
