//! Dht node handle.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::common::{Id, Node};
use crate::rpc::{Config, GetPeer, Rpc, State};
use crate::Result;

/// A DHT node: owns the engine and the poll-loop thread servicing the socket.
pub struct Dht {
    rpc: Arc<Rpc>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dht {
    /// Bind the transport and start joining the network through `bootstrap`.
    ///
    /// `completion` is called exactly once: with `Ok(())` as soon as any
    /// bootstrap node responds, or with `Err(Error::Timeout)` after the whole
    /// list was contacted without a response. The node keeps serving inbound
    /// traffic either way.
    pub fn start<F>(bootstrap: &[Node], port: u16, completion: F) -> Result<Dht>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Self::start_with_config(
            bootstrap,
            Config {
                port,
                ..Default::default()
            },
            completion,
        )
    }

    /// Same as [Self::start] with an explicit [Config].
    pub fn start_with_config<F>(bootstrap: &[Node], config: Config, completion: F) -> Result<Dht>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let rpc = Arc::new(Rpc::new(&config)?);

        let poll_thread = {
            let rpc = rpc.clone();

            thread::Builder::new()
                .name("kadmos-poll".into())
                .spawn(move || {
                    while rpc.running_flag() {
                        Rpc::tick(&rpc);
                    }
                })?
        };

        Rpc::join(&rpc, bootstrap.to_vec(), Box::new(completion));

        Ok(Dht {
            rpc,
            poll_thread: Mutex::new(Some(poll_thread)),
        })
    }

    // === Getters ===

    /// Returns `true` while the engine is in the `Running` state.
    pub fn is_running(&self) -> bool {
        self.rpc.is_running()
    }

    pub fn state(&self) -> State {
        self.rpc.state()
    }

    /// The bound socket address and this node's id.
    pub fn local_addr(&self) -> (SocketAddrV4, Id) {
        (self.rpc.local_addr(), self.rpc.id())
    }

    /// A snapshot of the nodes currently in the routing table.
    pub fn nodes(&self) -> Vec<Node> {
        self.rpc.nodes()
    }

    // === Public Methods ===

    /// Iteratively look up the node with `target` id.
    pub fn get_peer(&self, target: Id) -> GetPeer {
        Rpc::get_peer(&self.rpc, target)
    }

    /// Stop the poll loop and the scheduler and release the transport.
    ///
    /// In-flight correlations are not drained; their callbacks observe the
    /// stopped engine and leave it untouched.
    pub fn stop(&self) {
        self.rpc.stop();

        let handle = self
            .poll_thread
            .lock()
            .expect("poll thread lock poisoned")
            .take();

        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use std::net::UdpSocket;
    use std::time::Duration;

    use super::*;
    use crate::common::{Message, MessageKind};
    use crate::Error;

    fn loopback(socket: &UdpSocket) -> SocketAddrV4 {
        match socket.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => SocketAddrV4::new([127, 0, 0, 1].into(), addr.port()),
            _ => unreachable!(),
        }
    }

    fn test_config() -> Config {
        Config {
            port: 0,
            request_timeout: Duration::from_millis(300),
        }
    }

    fn recv_message(socket: &UdpSocket) -> (Message, SocketAddrV4) {
        let mut buf = [0_u8; 2048];
        let (amt, from) = socket.recv_from(&mut buf).unwrap();
        let from = match from {
            std::net::SocketAddr::V4(from) => from,
            _ => unreachable!(),
        };
        (Message::from_bytes(&buf[..amt]).unwrap(), from)
    }

    #[test]
    fn join_success() {
        let peer_id = Id::random();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let peer_addr = loopback(&peer);

        let peer_thread = thread::spawn(move || {
            let (message, from) = recv_message(&peer);

            assert!(matches!(message.kind, MessageKind::Lookup(_)));

            let reply = Message {
                message_id: message.message_id,
                sender_id: peer_id,
                kind: MessageKind::Response(vec![Node::new(
                    Id::random(),
                    SocketAddrV4::new([127, 0, 0, 1].into(), 9),
                )]),
            };
            peer.send_to(&reply.to_bytes(), std::net::SocketAddr::V4(from))
                .unwrap();
        });

        let (tx, rx) = flume::bounded(1);

        let dht = Dht::start_with_config(
            &[Node::new(peer_id, peer_addr)],
            test_config(),
            move |result| {
                let _ = tx.send(result.is_ok());
            },
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        peer_thread.join().unwrap();

        assert!(dht.is_running());
        assert!(dht.nodes().iter().any(|node| node.id == peer_id));

        dht.stop();
        assert_eq!(dht.state(), State::Stopped);
        assert!(!dht.is_running());
    }

    #[test]
    fn instant_responses_are_not_lost() {
        // A loopback peer answers as fast as it can; a response arriving
        // while the request is still being set up must be correlated, not
        // dropped and misread as a timeout.
        for _ in 0..10 {
            let peer_id = Id::random();
            let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let peer_addr = loopback(&peer);

            let peer_thread = thread::spawn(move || {
                let (message, from) = recv_message(&peer);

                let reply = Message {
                    message_id: message.message_id,
                    sender_id: peer_id,
                    kind: MessageKind::Response(Vec::new()),
                };
                peer.send_to(&reply.to_bytes(), std::net::SocketAddr::V4(from))
                    .unwrap();
            });

            let (tx, rx) = flume::bounded(1);

            let _dht = Dht::start_with_config(
                &[Node::new(peer_id, peer_addr)],
                test_config(),
                move |result| {
                    let _ = tx.send(result.is_ok());
                },
            )
            .unwrap();

            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
            peer_thread.join().unwrap();
        }
    }

    #[test]
    fn join_timeout() {
        // A bound socket that never replies.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let silent_addr = loopback(&silent);

        let (tx, rx) = flume::bounded(1);

        let dht = Dht::start_with_config(
            &[Node::new(Id::random(), silent_addr)],
            test_config(),
            move |result| {
                let _ = tx.send(matches!(result, Err(Error::Timeout)));
            },
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        // A failed join still leaves the node serving inbound traffic.
        assert!(dht.is_running());
    }

    #[test]
    fn empty_bootstrap_reports_timeout() {
        let (tx, rx) = flume::bounded(1);

        let dht = Dht::start_with_config(&[], test_config(), move |result| {
            let _ = tx.send(matches!(result, Err(Error::Timeout)));
        })
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(dht.is_running());
    }

    /// Ids sharing the highest bucket relative to `local`, distinct in the
    /// last byte.
    fn bucket_fellow(local: &Id, i: u8) -> Id {
        let mut bytes = *local.as_bytes();
        bytes[0] ^= 0x80;
        bytes[15] = i;
        Id(bytes)
    }

    /// Fill one bucket of a running node over capacity and drive the
    /// verification ping from the incumbent's side.
    fn eviction_scenario(incumbent_answers: bool) {
        let dht = Dht::start_with_config(&[], test_config(), |_| {}).unwrap();
        let (dht_addr, dht_id) = dht.local_addr();
        let dht_addr = SocketAddrV4::new([127, 0, 0, 1].into(), dht_addr.port());

        let incumbent_id = bucket_fellow(&dht_id, 0);
        let incumbent = UdpSocket::bind("127.0.0.1:0").unwrap();
        incumbent
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let ping = |socket: &UdpSocket, sender_id: Id| {
            let message = Message {
                message_id: Id::random(),
                sender_id,
                kind: MessageKind::Ping,
            };
            socket.send_to(&message.to_bytes(), dht_addr).unwrap();
        };

        // The incumbent is recorded first, making it the least recently seen.
        ping(&incumbent, incumbent_id);
        thread::sleep(Duration::from_millis(30));

        let fellows = (1..crate::MAX_BUCKET_SIZE_K as u8)
            .map(|i| {
                let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
                ping(&socket, bucket_fellow(&dht_id, i));
                thread::sleep(Duration::from_millis(5));
                socket
            })
            .collect::<Vec<_>>();

        // The bucket is now full; one more distinct node challenges the
        // incumbent.
        let candidate_id = bucket_fellow(&dht_id, 99);
        let candidate = UdpSocket::bind("127.0.0.1:0").unwrap();
        ping(&candidate, candidate_id);

        // The dht answers our pings with pongs; skip those until the
        // verification ping arrives.
        let verification = loop {
            let (message, _) = recv_message(&incumbent);
            if message.kind == MessageKind::Ping {
                break message;
            }
        };

        if incumbent_answers {
            let pong = Message {
                message_id: verification.message_id,
                sender_id: incumbent_id,
                kind: MessageKind::Response(Vec::new()),
            };
            incumbent
                .send_to(&pong.to_bytes(), dht_addr)
                .unwrap();

            thread::sleep(Duration::from_millis(100));
        } else {
            // Wait out the request timeout instead.
            thread::sleep(Duration::from_millis(500));
        }

        let ids = dht.nodes().iter().map(|node| node.id).collect::<Vec<_>>();

        assert!(
            ids.contains(&candidate_id),
            "candidate must win the slot (incumbent answered: {incumbent_answers})"
        );
        assert!(
            !ids.contains(&incumbent_id),
            "incumbent must be evicted (incumbent answered: {incumbent_answers})"
        );

        drop(fellows);
    }

    #[test]
    fn bucket_eviction_on_pong() {
        eviction_scenario(true);
    }

    #[test]
    fn bucket_eviction_on_timeout() {
        eviction_scenario(false);
    }

    #[test]
    fn get_peer_before_join_finds_nothing() {
        let dht = Dht::start_with_config(&[], test_config(), |_| {}).unwrap();

        // Empty routing table: the first round has no candidates.
        let result = dht.get_peer(Id::random()).recv_timeout(Duration::from_secs(2));

        assert!(matches!(result, Err(Error::Timeout)));
    }
}
