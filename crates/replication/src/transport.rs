use crate::{crypto, Error, Nonce, ReplicationOperation, SymmetricKey, NONCE_SIZE};
use prost::Message;
use proto_breakwater::{ReplicationMsg, ReplicationSink};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, RwLock};

/// Per-sender receive state: the last counter seen and the session bytes
/// it belongs to.
struct RecvState {
    counter: u32,
    session: Vec<u8>,
}

struct Inner {
    socket: UdpSocket,
    key: SymmetricKey,
    peers: RwLock<Vec<SocketAddr>>,
    send_nonce: Mutex<Nonce>,
    recv_nonces: Mutex<HashMap<SocketAddr, RecvState>>,
}

/// The replication transport: encrypts outbound frames under an
/// incrementing nonce and fans them out to every configured peer over UDP.
/// Delivery is best-effort; transport failures never fail the local
/// mutation that triggered them.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl Replicator {
    pub fn new(key: SymmetricKey, peers: Vec<SocketAddr>) -> Result<Replicator, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Replicator {
            inner: Arc::new(Inner {
                socket,
                key,
                peers: RwLock::new(peers),
                send_nonce: Mutex::new(Nonce::random()),
                recv_nonces: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn add_peer(&self, peer: SocketAddr) {
        self.inner.peers.write().unwrap().push(peer);
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.inner.peers.read().unwrap().clone()
    }

    /// Encrypt and send one frame to every peer.
    pub fn replicate(&self, msg: ReplicationMsg) {
        let plaintext = msg.encode_to_vec();

        // The nonce advances under its own lock; sends happen outside it.
        let (nonce, ciphertext) = {
            let mut send_nonce = self.inner.send_nonce.lock().unwrap();
            let nonce = *send_nonce;
            let ciphertext = match crypto::encrypt(&self.inner.key, &nonce, &plaintext) {
                Ok(ct) => ct,
                Err(err) => {
                    tracing::error!(%err, "encrypting replication frame");
                    return;
                }
            };
            send_nonce.increment();
            (nonce, ciphertext)
        };

        let mut packet = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        packet.extend_from_slice(nonce.as_bytes());
        packet.extend_from_slice(&ciphertext);

        for peer in self.inner.peers.read().unwrap().iter() {
            match self.inner.socket.send_to(&packet, peer) {
                Ok(_) => ops::metrics::REPLICATION_SENT.inc(),
                Err(err) => tracing::warn!(%peer, %err, "sending replication datagram"),
            }
        }
    }

    /// A sink handle for wiring into the stores.
    pub fn sink(&self) -> ReplicationSink {
        let this = self.clone();
        Arc::new(move |msg| this.replicate(msg))
    }

    /// Bind `listen` and run the receive loop on a dedicated thread for
    /// the remaining process lifetime.
    pub fn start_receiver(&self, listen: SocketAddr) -> Result<(), Error> {
        let socket = UdpSocket::bind(listen)?;
        tracing::info!(%listen, "replication receiver listening");
        let this = self.clone();
        std::thread::Builder::new()
            .name("bw/repl-recv".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; 65_535];
                loop {
                    match socket.recv_from(&mut buf) {
                        Ok((len, src)) => this.handle_datagram(&buf[..len], src),
                        Err(err) => tracing::warn!(%err, "replication socket recv"),
                    }
                }
            })?;
        Ok(())
    }

    /// Decode, authenticate, and apply one inbound datagram. Every failure
    /// is a logged drop: the transport never tears down on bad input.
    pub(crate) fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        if data.len() <= NONCE_SIZE {
            tracing::warn!(%src, len = data.len(), "short replication datagram");
            ops::metrics::REPLICATION_RCVD
                .with_label_values(&["parse_fail"])
                .inc();
            return;
        }
        let nonce = Nonce::from_bytes(&data[..NONCE_SIZE]).expect("length checked above");

        // Reject datagrams whose nonce does not advance within a session.
        {
            let mut recv = self.inner.recv_nonces.lock().unwrap();
            match recv.get_mut(&src) {
                Some(state) if state.session == nonce.session() => {
                    if nonce.counter() <= state.counter {
                        tracing::warn!(%src, counter = nonce.counter(), "stale replication nonce");
                        ops::metrics::REPLICATION_RCVD
                            .with_label_values(&["stale_nonce"])
                            .inc();
                        return;
                    }
                    state.counter = nonce.counter();
                }
                _ => {
                    // First contact, or the sender restarted with a new
                    // session.
                    recv.insert(
                        src,
                        RecvState {
                            counter: nonce.counter(),
                            session: nonce.session().to_vec(),
                        },
                    );
                }
            }
        }

        let plaintext = match crypto::decrypt(&self.inner.key, &nonce, &data[NONCE_SIZE..]) {
            Ok(pt) => pt,
            Err(_) => {
                tracing::warn!(%src, "replication datagram failed authentication");
                ops::metrics::REPLICATION_RCVD
                    .with_label_values(&["decrypt_fail"])
                    .inc();
                return;
            }
        };

        match ReplicationOperation::unserialize(&plaintext) {
            Ok(op) => {
                op.apply();
                ops::metrics::REPLICATION_RCVD.with_label_values(&["ok"]).inc();
            }
            Err(err) => {
                tracing::warn!(%src, %err, "unparseable replication frame");
                ops::metrics::REPLICATION_RCVD
                    .with_label_values(&["parse_fail"])
                    .inc();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::generate_key;
    use proto_breakwater::{RepType, SdbOpType, SdbOperation};

    fn key() -> SymmetricKey {
        SymmetricKey::from_base64(&generate_key()).unwrap()
    }

    fn sdb_add_frame(db_name: &str, key: &str, value: i64) -> ReplicationMsg {
        let op = SdbOperation {
            op_type: SdbOpType::Add as i32,
            db_name: db_name.to_string(),
            key: key.to_string(),
            field_name: Some("cnt".to_string()),
            str_param: None,
            int_param: Some(value),
        };
        ReplicationMsg {
            rep_type: RepType::Sdb as i32,
            rep_op: op.encode_to_vec(),
        }
    }

    fn encrypt_packet(k: &SymmetricKey, nonce: &Nonce, msg: &ReplicationMsg) -> Vec<u8> {
        let ciphertext = crypto::encrypt(k, nonce, &msg.encode_to_vec()).unwrap();
        let mut packet = Vec::new();
        packet.extend_from_slice(nonce.as_bytes());
        packet.extend_from_slice(&ciphertext);
        packet
    }

    #[test]
    fn datagrams_apply_and_replays_are_dropped() {
        let db = statsdb::StatsDb::with_fields(
            "transport-apply-db",
            10,
            6,
            1,
            statsdb::parse_field_schema([("cnt", "int")]).unwrap(),
        );
        statsdb::register(db.clone()).unwrap();

        let shared = key();
        let receiver = Replicator::new(shared.clone(), Vec::new()).unwrap();
        let src: SocketAddr = "198.51.100.9:4001".parse().unwrap();

        let mut nonce = Nonce::random();
        let msg = sdb_add_frame("transport-apply-db", "u:1", 4);

        receiver.handle_datagram(&encrypt_packet(&shared, &nonce, &msg), src);
        assert_eq!(db.get(&statsdb::Key::from("u:1"), "cnt", None), 4);

        // The exact same packet again: the nonce did not advance.
        receiver.handle_datagram(&encrypt_packet(&shared, &nonce, &msg), src);
        assert_eq!(db.get(&statsdb::Key::from("u:1"), "cnt", None), 4);

        // An advanced nonce goes through; commutative adds accumulate.
        nonce.increment();
        receiver.handle_datagram(&encrypt_packet(&shared, &nonce, &msg), src);
        assert_eq!(db.get(&statsdb::Key::from("u:1"), "cnt", None), 8);
    }

    #[test]
    fn foreign_keys_and_garbage_are_dropped() {
        let db = statsdb::StatsDb::with_fields(
            "transport-garbage-db",
            10,
            6,
            1,
            statsdb::parse_field_schema([("cnt", "int")]).unwrap(),
        );
        statsdb::register(db.clone()).unwrap();

        let receiver = Replicator::new(key(), Vec::new()).unwrap();
        let src: SocketAddr = "198.51.100.9:4002".parse().unwrap();

        // Too short to carry a nonce.
        receiver.handle_datagram(&[0u8; 4], src);

        // Encrypted under a different key.
        let other = key();
        let nonce = Nonce::random();
        let msg = sdb_add_frame("transport-garbage-db", "u:1", 4);
        receiver.handle_datagram(&encrypt_packet(&other, &nonce, &msg), src);

        assert_eq!(db.get(&statsdb::Key::from("u:1"), "cnt", None), 0);
    }

    #[test]
    fn end_to_end_over_loopback() {
        let db = statsdb::StatsDb::with_fields(
            "transport-e2e-db",
            10,
            6,
            2,
            statsdb::parse_field_schema([("cnt", "int")]).unwrap(),
        );
        statsdb::register(db.clone()).unwrap();

        let shared = key();
        let receiver = Replicator::new(shared.clone(), Vec::new()).unwrap();

        // Bind an ephemeral port for the receiver, then point a sender at it.
        let probe = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let listen = probe.local_addr().unwrap();
        drop(probe);
        receiver.start_receiver(listen).unwrap();

        let sender = Replicator::new(shared, vec![listen]).unwrap();
        sender.replicate(sdb_add_frame("transport-e2e-db", "u:9", 3));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while db.get(&statsdb::Key::from("u:9"), "cnt", None) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(db.get(&statsdb::Key::from("u:9"), "cnt", None), 3);
    }
}
