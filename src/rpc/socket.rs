//! UDP socket layer decoding incoming datagrams into wire messages.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::common::Message;
use crate::Result;

const MTU: usize = 2048;

/// The maximum duration to backoff checking the [UdpSocket] buffer after it is
/// empty. Lower values increase CPU usage, but reduce latency and drain the
/// buffer faster, reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Hard `recv_from` failures tolerated before the transport is declared
/// defective and the process aborted.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 8;

/// A UdpSocket wrapper that encodes and decodes DHT wire messages.
#[derive(Debug)]
pub struct DhtSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    recv_errors: AtomicU32,
}

impl DhtSocket {
    /// Bind to the given port on all v4 interfaces; port `0` asks the OS for
    /// any free port.
    pub fn bind(port: u16) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("DhtSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            local_addr,
            recv_errors: AtomicU32::new(0),
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a wire message to the given address.
    pub fn send(&self, address: SocketAddrV4, message: &Message) -> Result<()> {
        self.socket.send_to(&message.to_bytes(), address)?;
        trace!(context = "socket_message_sending", ?message, ?address);
        Ok(())
    }

    /// Receives a single datagram from the socket.
    ///
    /// On success, returns the decoded message and the origin. Returns `None`
    /// after a bounded backoff when the buffer is empty, and silently drops
    /// malformed frames, IPv6 sources, and responses from port 0.
    pub fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                self.recv_errors.store(0, Ordering::Relaxed);

                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(context = "socket_validation", message = "Datagram from port 0");
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(
                            context = "socket_message_receiving",
                            ?message,
                            ?from,
                            "Received message"
                        );
                        return Some((message, from));
                    }
                    Err(decode_error) => {
                        debug!(
                            context = "socket_error",
                            ?decode_error,
                            ?from,
                            "Dropping malformed datagram"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", message = "Received IPv6 packet");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.recv_errors.store(0, Ordering::Relaxed);
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                // Repeated hard failures indicate a broken transport, which
                // the node can not recover from.
                let errors = self.recv_errors.fetch_add(1, Ordering::Relaxed) + 1;

                if errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                    error!(context = "socket_error", ?e, "Transport failure, aborting");
                    std::process::abort();
                }

                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::common::{Id, MessageKind};

    #[test]
    fn bind_any_port() {
        let socket = DhtSocket::bind(0).unwrap();

        assert_ne!(socket.local_addr().port(), 0);
    }

    #[test]
    fn send_and_receive() {
        let server = DhtSocket::bind(0).unwrap();
        let server_address = SocketAddrV4::new([127, 0, 0, 1].into(), server.local_addr().port());

        let client = DhtSocket::bind(0).unwrap();
        let client_port = client.local_addr().port();

        let message = Message {
            message_id: Id::random(),
            sender_id: Id::random(),
            kind: MessageKind::Ping,
        };
        let expected = message.clone();

        let server_thread = thread::spawn(move || loop {
            if let Some((message, from)) = server.recv_from() {
                assert_eq!(from.port(), client_port);
                assert_eq!(message, expected);
                break;
            }
        });

        client.send(server_address, &message).unwrap();

        server_thread.join().unwrap();
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let server = DhtSocket::bind(0).unwrap();
        let server_address = SocketAddrV4::new([127, 0, 0, 1].into(), server.local_addr().port());

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[1, 2, 3], server_address).unwrap();

        thread::sleep(Duration::from_millis(20));

        assert!(server.recv_from().is_none());
    }
}
