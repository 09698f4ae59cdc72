//! Minimal UDP stand-in for the dealer/sub socket pair a real server
//! speaks over ZeroMQ DEALER/SUB. This binary only needs something that
//! satisfies `netsync_core::Transport` well enough to demonstrate the
//! session wiring end to end.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use netsync_core::{SendOutcome, Transport};

pub struct UdpTransport {
    send_socket: UdpSocket,
    recv_socket: UdpSocket,
    room_id: String,
}

impl UdpTransport {
    pub fn connect(server: Ipv4Addr, dealer_port: u16, sub_port: u16) -> std::io::Result<Self> {
        let send_socket = UdpSocket::bind(("0.0.0.0", 0))?;
        send_socket.connect((server, dealer_port))?;

        let recv_socket = UdpSocket::bind(("0.0.0.0", sub_port))?;

        Ok(Self { send_socket, recv_socket, room_id: String::new() })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, room_id: &str, payload: &[u8]) -> SendOutcome {
        self.room_id = room_id.to_string();
        match self.send_socket.send(payload) {
            Ok(_) => SendOutcome::Sent,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => SendOutcome::Backpressure,
            Err(e) => SendOutcome::Fatal(e.to_string()),
        }
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Option<(String, Vec<u8>)> {
        self.recv_socket.set_read_timeout(Some(timeout)).ok()?;
        let mut buf = [0u8; 65536];
        match self.recv_socket.recv(&mut buf) {
            Ok(n) => Some((self.room_id.clone(), buf[..n].to_vec())),
            Err(_) => None,
        }
    }
}
