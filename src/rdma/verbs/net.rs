//! Conversions between `std::net` socket addresses and their C layouts.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// A type with the same memory layout as `sockaddr`, exactly as large as
/// the largest address it holds.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub fn new(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => Self { v4: v4_into_c(a) },
            SocketAddr::V6(a) => Self { v6: v6_into_c(a) },
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        self as *mut _ as *mut libc::sockaddr
    }
}

fn v4_into_c(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        // `s_addr` is stored big-endian, just like the octets.
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        // SAFETY: all-zero padding is valid.
        ..unsafe { mem::zeroed() }
    }
}

fn v6_into_c(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_flowinfo: addr.flowinfo(),
        sin6_scope_id: addr.scope_id(),
    }
}

/// Read a socket address written by the C library.
///
/// Return `None` for null pointers and for families other than IPv4/IPv6.
///
/// # Safety
///
/// `addr`, if not null, must point to a valid address of the family it
/// declares.
pub(crate) unsafe fn from_c(addr: *const libc::sockaddr) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    match (*addr).sa_family as i32 {
        libc::AF_INET => {
            let a = &*(addr as *const libc::sockaddr_in);
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(a.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(a.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let a = &*(addr as *const libc::sockaddr_in6);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(a.sin6_addr.s6_addr),
                u16::from_be(a.sin6_port),
                a.sin6_flowinfo,
                a.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_survive_the_c_layout() {
        for addr in [
            SocketAddr::from(([192, 168, 1, 7], 7471)),
            SocketAddr::from(([0xfe80, 0, 0, 0, 0, 0, 0, 1], 18515)),
        ] {
            let mut repr = SocketAddrCRepr::new(&addr);
            let back = unsafe { from_c(repr.as_mut_ptr()) };
            assert_eq!(back, Some(addr));
        }
        assert_eq!(unsafe { from_c(std::ptr::null()) }, None);
    }
}
