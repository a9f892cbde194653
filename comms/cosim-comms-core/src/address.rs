//! Helpers for the `proto://host:port` address strings used in configuration
//! and in route information.

use crate::config::InterfaceNetworks;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};

pub const LOCALHOST: &str = "localhost";

/// Joins an interface and a port, bracketing bare IPv6 literals.
pub fn make_port_address(interface: &str, port: u16) -> String {
    if is_ipv6(interface) && !interface.starts_with('[') {
        format!("[{interface}]:{port}")
    } else {
        format!("{interface}:{port}")
    }
}

/// Splits `host:port`. The port is `None` when missing or not a number.
///
/// ```
/// # use cosim_comms_core::address::extract_interface_and_port;
/// assert_eq!(extract_interface_and_port("tcp://10.0.0.1:24160"), ("tcp://10.0.0.1".to_string(), Some(24160)));
/// assert_eq!(extract_interface_and_port("[::1]:80"), ("::1".to_string(), Some(80)));
/// assert_eq!(extract_interface_and_port("broker"), ("broker".to_string(), None));
/// ```
pub fn extract_interface_and_port(address: &str) -> (String, Option<u16>) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    // Bare IPv6 literals have no port
    if strip_protocol(address).matches(':').count() > 1 {
        return (address.to_string(), None);
    }
    match address.rfind(':') {
        Some(split) if !address[split + 1..].starts_with("//") => {
            match address[split + 1..].parse() {
                Ok(port) => (address[..split].to_string(), Some(port)),
                Err(_) => (address.to_string(), None),
            }
        }
        _ => (address.to_string(), None),
    }
}

/// Drops a leading `proto://`, if any.
pub fn strip_protocol(address: &str) -> &str {
    match address.find("://") {
        Some(split) => &address[split + 3..],
        None => address,
    }
}

pub fn is_ipv6(address: &str) -> bool {
    let address = strip_protocol(address);
    let address = address
        .strip_prefix('[')
        .and_then(|a| a.split_once(']'))
        .map_or(address, |(host, _)| host);
    address.parse::<Ipv6Addr>().is_ok()
}

/// Whether `host` names this machine's loopback interface.
pub fn is_loopback(host: &str) -> bool {
    let host = strip_protocol(host);
    host == LOCALHOST
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_or(false, |ip| ip.is_loopback())
}

/// Finds the address of the local interface that would be used to reach
/// `target`. Falls back to the wildcard address for the network family when
/// the route cannot be determined.
pub fn generate_matching_interface_address(target: &str, network: InterfaceNetworks) -> String {
    let (host, _) = extract_interface_and_port(strip_protocol(target));
    if is_loopback(&host) {
        return match network {
            InterfaceNetworks::Ipv6 => "::1".to_string(),
            _ => "127.0.0.1".to_string(),
        };
    }

    let ipv6 = match network {
        InterfaceNetworks::Ipv6 => true,
        InterfaceNetworks::Ipv4 | InterfaceNetworks::Local => false,
        InterfaceNetworks::All => is_ipv6(&host),
    };
    let unspecified = if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };

    // Connecting a datagram socket sends nothing but asks the OS to pick the
    // outgoing interface
    let local = UdpSocket::bind((unspecified, 0))
        .and_then(|socket| socket.connect((host.as_str(), 9)).map(|_| socket))
        .and_then(|socket| socket.local_addr());
    match local {
        Ok(address) => address.ip().to_string(),
        Err(e) => {
            tracing::warn!("Unable to find an interface matching {}: {}", host, e);
            let wildcard = if ipv6 { "::" } else { "*" };
            wildcard.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_addresses() {
        assert_eq!(make_port_address("localhost", 23901), "localhost:23901");
        assert_eq!(make_port_address("::1", 23901), "[::1]:23901");
        assert_eq!(make_port_address("tcp://*", 5), "tcp://*:5");
    }

    #[test]
    fn protocols() {
        assert_eq!(strip_protocol("udp://10.1.1.1:4"), "10.1.1.1:4");
        assert_eq!(strip_protocol("10.1.1.1"), "10.1.1.1");
        assert_eq!(strip_protocol("tcp://[::1]:7"), "[::1]:7");
    }

    #[test]
    fn splitting() {
        assert_eq!(
            extract_interface_and_port("host:notaport"),
            ("host:notaport".to_string(), None)
        );
        assert_eq!(
            extract_interface_and_port("tcp://host"),
            ("tcp://host".to_string(), None)
        );
        assert_eq!(extract_interface_and_port("::1"), ("::1".to_string(), None));
    }

    #[test]
    fn families() {
        assert!(is_ipv6("::1"));
        assert!(is_ipv6("[fe80::1]:80"));
        assert!(!is_ipv6("127.0.0.1"));
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("[::1]"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("10.0.0.1"));
    }

    #[test]
    fn loopback_target_matches_loopback() {
        assert_eq!(
            generate_matching_interface_address("127.0.0.1:23901", InterfaceNetworks::Ipv4),
            "127.0.0.1"
        );
        assert_eq!(
            generate_matching_interface_address("localhost", InterfaceNetworks::Ipv6),
            "::1"
        );
    }
}
