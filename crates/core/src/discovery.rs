//! Server discovery: UDP broadcast probe, with a TCP subnet-scan fallback.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

pub const DISCOVER_MESSAGE: &[u8] = b"STYLY-NETSYNC-DISCOVER";
const REPLY_PREFIX: &str = "STYLY-NETSYNC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub address: Ipv4Addr,
    pub dealer_port: u16,
    pub sub_port: u16,
}

fn parse_reply(reply: &str) -> Option<(u16, u16)> {
    let mut parts = reply.split('|');
    if parts.next()? != REPLY_PREFIX {
        return None;
    }
    let dealer_port: u16 = parts.next()?.parse().ok()?;
    let sub_port: u16 = parts.next()?.parse().ok()?;
    Some((dealer_port, sub_port))
}

/// Sends the discover beacon on `socket` and blocks (bounded by `timeout`)
/// for the first reply, returning `None` on timeout or unparseable reply.
pub fn broadcast_probe(socket: &UdpSocket, beacon_port: u16, timeout: Duration) -> std::io::Result<Option<DiscoveredServer>> {
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(timeout))?;

    socket.send_to(DISCOVER_MESSAGE, (Ipv4Addr::BROADCAST, beacon_port))?;

    let mut buf = [0u8; 256];
    match socket.recv_from(&mut buf) {
        Ok((n, from)) => {
            let reply = String::from_utf8_lossy(&buf[..n]);
            let Some((dealer_port, sub_port)) = parse_reply(&reply) else {
                return Ok(None);
            };
            let SocketAddr::V4(v4) = from else { return Ok(None) };
            Ok(Some(DiscoveredServer { address: *v4.ip(), dealer_port, sub_port }))
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(e),
    }
}

/// Probes one candidate address over TCP with the same discover/reply
/// handshake used for broadcast. Used both for "last known server" retries
/// and for each host visited during a subnet scan.
pub fn tcp_probe(addr: Ipv4Addr, beacon_port: u16, timeout: Duration) -> Option<DiscoveredServer> {
    let mut stream = TcpStream::connect_timeout(&SocketAddr::new(IpAddr::V4(addr), beacon_port), timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.write_all(DISCOVER_MESSAGE).ok()?;

    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).ok()?;
    let reply = String::from_utf8_lossy(&buf[..n]);
    let (dealer_port, sub_port) = parse_reply(&reply)?;
    Some(DiscoveredServer { address: addr, dealer_port, sub_port })
}

/// Enumerates the 254 host addresses of `base`'s /24 in round-robin order,
/// offset by `rotation` so repeated scans don't always start from `.1`.
pub fn scan_order(base: Ipv4Addr, exclude: Ipv4Addr, rotation: u32) -> Vec<Ipv4Addr> {
    let octets = base.octets();
    let mut hosts: Vec<u8> = (1..=254u8)
        .filter(|&h| Ipv4Addr::new(octets[0], octets[1], octets[2], h) != exclude)
        .collect();

    let offset = (rotation as usize) % hosts.len().max(1);
    hosts.rotate_left(offset.min(hosts.len()));

    hosts.into_iter().map(|h| Ipv4Addr::new(octets[0], octets[1], octets[2], h)).collect()
}

/// Default number of hosts probed concurrently by [`scan_strategy`].
pub const DEFAULT_SCAN_CONCURRENCY: usize = 32;

/// Scans `candidates` (after trying the supplied last-known addresses
/// first, still sequentially — there are usually only one or two), probing
/// the subnet in batches of up to [`DEFAULT_SCAN_CONCURRENCY`] hosts at a
/// time and stopping at the first success.
pub fn scan_strategy(
    last_known: &[Ipv4Addr],
    subnet_base: Ipv4Addr,
    local_addr: Ipv4Addr,
    rotation: u32,
    beacon_port: u16,
    per_host_timeout: Duration,
) -> Option<DiscoveredServer> {
    scan_strategy_with_concurrency(last_known, subnet_base, local_addr, rotation, beacon_port, per_host_timeout, DEFAULT_SCAN_CONCURRENCY)
}

/// Same as [`scan_strategy`] with an explicit batch size, for tests and
/// callers that want to tune it.
pub fn scan_strategy_with_concurrency(
    last_known: &[Ipv4Addr],
    subnet_base: Ipv4Addr,
    local_addr: Ipv4Addr,
    rotation: u32,
    beacon_port: u16,
    per_host_timeout: Duration,
    concurrency: usize,
) -> Option<DiscoveredServer> {
    for &addr in last_known {
        if let Some(found) = tcp_probe(addr, beacon_port, per_host_timeout) {
            return Some(found);
        }
    }

    let hosts = scan_order(subnet_base, local_addr, rotation);
    for batch in hosts.chunks(concurrency.max(1)) {
        if let Some(found) = probe_batch(batch, beacon_port, per_host_timeout) {
            return Some(found);
        }
    }

    None
}

/// Probes one batch of hosts on their own OS thread each, joining all of
/// them before moving to the next batch.
fn probe_batch(batch: &[Ipv4Addr], beacon_port: u16, per_host_timeout: Duration) -> Option<DiscoveredServer> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = batch
            .iter()
            .map(|&addr| scope.spawn(move || tcp_probe(addr, beacon_port, per_host_timeout)))
            .collect();
        handles.into_iter().find_map(|h| h.join().ok().flatten())
    })
}
