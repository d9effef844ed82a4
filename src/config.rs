//! Server configuration
//!
//! Parsing lives elsewhere; this module receives the already-parsed `server`
//! block and stream name, and checks them the way
//! [`Stream::open_with_config`](crate::pcm::Stream::open_with_config) needs
//! them checked. The one interesting rule: the shm transport only works
//! between processes on the same machine, so the configured host must
//! resolve to an address held by one of the local interfaces.

use crate::error::*;
use libc::c_int;
use log::error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::PathBuf;
use std::ptr;

/// The `server` configuration block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// Filesystem path of the server's listening socket.
    pub socket: PathBuf,
    /// Kept for config compatibility; the local transport never dials it.
    pub port: Option<u16>,
}

/// Everything the configuration layer hands over for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmConfig {
    pub server: ServerConfig,
    /// Stream name within the server.
    pub sname: String,
}

impl ShmConfig {
    /// Rejects configurations [`Stream::open`](crate::pcm::Stream::open)
    /// could not use: missing fields, an oversize stream name, or a host
    /// that is not this machine. Performs no I/O beyond name resolution and
    /// an interface enumeration - in particular, no socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.sname.is_empty() {
            error!("sname is not defined");
            return Err(Error::invalid_argument("config: sname is not defined"));
        }
        if self.sname.len() > crate::shm::MAX_NAME_LEN {
            return Err(Error::invalid_argument("config: stream name too long"));
        }
        if self.server.host.is_empty() {
            error!("host is not defined");
            return Err(Error::invalid_argument("config: host is not defined"));
        }
        if self.server.socket.as_os_str().is_empty() {
            error!("socket is not defined");
            return Err(Error::invalid_argument("config: socket is not defined"));
        }
        if !is_local_host(&self.server.host)? {
            error!("{} is not the local host", self.server.host);
            return Err(Error::invalid_argument("config: host is not local"));
        }
        Ok(())
    }
}

fn resolve(host: &str) -> Result<Vec<IpAddr>> {
    let addrs = (host, 0u16).to_socket_addrs().map_err(|_| {
        error!("Cannot resolve {}", host);
        Error::invalid_argument("config: cannot resolve host")
    })?;
    Ok(addrs.map(|a| a.ip()).collect())
}

fn local_addrs() -> Result<Vec<IpAddr>> {
    let mut out = Vec::new();
    unsafe {
        let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(Error::sys("getifaddrs"));
        }
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null() {
                match (*ifa.ifa_addr).sa_family as c_int {
                    libc::AF_INET => {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        out.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))));
                    }
                    libc::AF_INET6 => {
                        let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        out.push(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
                    }
                    _ => {}
                }
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(ifap);
    }
    Ok(out)
}

/// True when `host` resolves (via the host name service) to an address held
/// by one of this machine's interfaces.
pub fn is_local_host(host: &str) -> Result<bool> {
    let resolved = resolve(host)?;
    let local = local_addrs()?;
    Ok(resolved.iter().any(|a| a.is_loopback() || local.contains(a)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn config(host: &str, sname: &str) -> ShmConfig {
        ShmConfig {
            server: ServerConfig {
                host: host.into(),
                socket: "/tmp/sndserver".into(),
                port: None,
            },
            sname: sname.into(),
        }
    }

    #[test]
    fn loopback_is_local() {
        assert!(is_local_host("127.0.0.1").unwrap());
        assert!(config("127.0.0.1", "default").validate().is_ok());
    }

    #[test]
    fn testnet_address_is_rejected() {
        // 192.0.2.0/24 is reserved for documentation, never assigned
        let e = config("192.0.2.1", "default").validate().err().unwrap();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(config("127.0.0.1", "").validate().is_err());
        assert!(config("", "default").validate().is_err());
        let mut c = config("127.0.0.1", "default");
        c.server.socket = PathBuf::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn oversize_name_is_rejected() {
        let long = "x".repeat(256);
        let e = config("127.0.0.1", &long).validate().err().unwrap();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert!(config("127.0.0.1", &"x".repeat(255)).validate().is_ok());
    }
}
