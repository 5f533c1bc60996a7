//! Local interface addresses, used by the client's self-target check

use std::net::IpAddr;

/// Every address bound to a local interface. Best effort: enumeration
/// failures yield an empty list, which disables the self check rather
/// than failing a transfer that would otherwise work.
pub fn local_addrs() -> Vec<IpAddr> {
    let mut addrs = Vec::new();

    let Ok(ifaddrs) = nix::ifaddrs::getifaddrs() else {
        return addrs;
    };

    for ifaddr in ifaddrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            addrs.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(sin6.ip()));
        }
    }

    addrs
}
