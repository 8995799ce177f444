use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Best guess at the IPv4 address other hosts can reach us on: the source
/// address the kernel picks for an outbound route. Connecting a UDP socket
/// sends no packets.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Address to advertise: the configured one, else the outbound route's
/// address, else loopback.
pub fn advertise_address(configured: Option<&str>) -> String {
    match configured {
        Some(address) if !address.is_empty() => address.to_owned(),
        _ => local_ipv4()
            .unwrap_or(Ipv4Addr::LOCALHOST)
            .to_string(),
    }
}
