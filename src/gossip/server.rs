//! The UDP gossip endpoint: authenticated packet pipeline, per-type
//! handlers, and the per-round peer admission rules.
//!
//! Every inbound datagram runs decrypt → parse header → verify signature →
//! parse body → dispatch; any failure along the way drops the packet. The
//! Brahms safety rule that a peer cannot push us unsolicited data is enforced
//! here through per-round peer conditions, cleared by the round engine at
//! each round boundary.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::server::ApiHandle;
use crate::challenge::{self, Challenger};
use crate::config::GossipConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::gossip::crypto::Crypto;
use crate::gossip::node::{Identity, Node};
use crate::gossip::packet::{self, PacketBody, PacketHeader, HEADER_SIZE};
use crate::gossip::store::{MessageStore, StoreError};
use crate::gossip::view::View;

/// Fatal endpoint startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not bind gossip endpoint on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

/// Per-round admission conditions a remote peer can hold with us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerCondition {
    /// We sent this peer a pull request; its pull response is welcome.
    AllowPull,
    /// A completed exchange entitles this peer to send gossip messages.
    AllowMessage,
    /// We sent this peer a push request; its challenge is welcome.
    AllowPushChallenge,
    /// This peer already used its one push attempt this round.
    DenyPush,
}

/// The UDP endpoint and all state the packet handlers touch.
pub struct Server {
    socket: UdpSocket,
    crypto: Crypto,
    challenger: Challenger,
    own_node: Node,
    challenge_difficulty: u32,
    challenge_max_solve: Duration,
    peer_conditions: Mutex<HashMap<Identity, HashSet<PeerCondition>>>,
    pong_waiters: Mutex<HashMap<Identity, mpsc::Sender<()>>>,
    pull_response_nodes: Mutex<Vec<Node>>,
    push_view: View,
    pull_view: View,
    store: Arc<Mutex<MessageStore>>,
    api: ApiHandle,
}

impl Server {
    /// Bind the UDP socket and assemble the endpoint. Binding failure is
    /// fatal to startup.
    pub async fn bind(
        cfg: &GossipConfig,
        crypto: Crypto,
        challenger: Challenger,
        store: Arc<Mutex<MessageStore>>,
        api: ApiHandle,
    ) -> Result<Arc<Self>, ServerError> {
        let socket = UdpSocket::bind(&cfg.gossip_address)
            .await
            .map_err(|source| ServerError::Bind {
                address: cfg.gossip_address.clone(),
                source,
            })?;
        tracing::info!(address = %cfg.gossip_address, "Gossip endpoint listening");

        let own_node = Node::new(crypto.identity(), cfg.gossip_address.clone());
        Ok(Arc::new(Server {
            socket,
            crypto,
            challenger,
            own_node,
            challenge_difficulty: cfg.challenge_difficulty,
            challenge_max_solve: cfg.challenge_max_solve,
            peer_conditions: Mutex::new(HashMap::new()),
            pong_waiters: Mutex::new(HashMap::new()),
            pull_response_nodes: Mutex::new(Vec::new()),
            push_view: View::new(),
            pull_view: View::new(),
            store,
            api,
        }))
    }

    /// Spawn the datagram read loop; each datagram is handled on its own
    /// task so a slow handler (e.g. a challenge solve) cannot stall the
    /// socket.
    pub fn spawn_recv_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = server.socket.recv_from(&mut buf) => {
                        let (len, from) = match received {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!(error = %e, "Error receiving datagram");
                                continue;
                            }
                        };
                        let data = buf[..len].to_vec();
                        let handler = Arc::clone(&server);
                        tokio::spawn(async move { handler.handle_datagram(data, from).await });
                    }
                }
            }
        });
    }

    /// The node this endpoint represents (identity + advertised address).
    pub fn own_node(&self) -> &Node {
        &self.own_node
    }

    pub fn store(&self) -> &Arc<Mutex<MessageStore>> {
        &self.store
    }

    pub fn push_view(&self) -> &View {
        &self.push_view
    }

    pub fn pull_view(&self) -> &View {
        &self.pull_view
    }

    // ── Round bookkeeping (driven by the engine) ──

    /// Forget all per-round peer conditions. Called at each round boundary.
    pub fn reset_round(&self) {
        self.peer_conditions
            .lock()
            .expect("peer condition lock poisoned")
            .clear();
    }

    /// Publish the snapshot of the main view served to pull requests.
    pub fn set_pull_response_nodes(&self, nodes: Vec<Node>) {
        *self
            .pull_response_nodes
            .lock()
            .expect("pull response lock poisoned") = nodes;
    }

    /// Send a push request; the peer's coming challenge is thereby welcome.
    pub async fn request_push(&self, node: &Node) {
        self.add_condition(node.identity, PeerCondition::AllowPushChallenge);
        self.send_packet(PacketBody::PushRequest, node.address.as_str(), &node.identity)
            .await;
    }

    /// Send a pull request; the peer's coming pull response is thereby
    /// welcome.
    pub async fn request_pull(&self, node: &Node) {
        self.add_condition(node.identity, PeerCondition::AllowPull);
        self.send_packet(PacketBody::PullRequest, node.address.as_str(), &node.identity)
            .await;
    }

    /// Ping a node and wait for its pong, bounded by `timeout`.
    pub async fn ping_and_wait(&self, node: &Node, timeout: Duration) -> bool {
        let (tx, mut rx) = mpsc::channel(1);
        self.pong_waiters
            .lock()
            .expect("pong waiter lock poisoned")
            .insert(node.identity, tx);

        self.send_packet(PacketBody::Ping, node.address.as_str(), &node.identity)
            .await;
        let answered = tokio::time::timeout(timeout, rx.recv()).await.is_ok();

        self.pong_waiters
            .lock()
            .expect("pong waiter lock poisoned")
            .remove(&node.identity);
        answered
    }

    // ── Inbound pipeline ──

    async fn handle_datagram(self: Arc<Self>, data: Vec<u8>, from: SocketAddr) {
        let signature_len = self.crypto.signature_len();
        if data.len() < HEADER_SIZE + signature_len {
            tracing::info!(%from, len = data.len(), "Dropping short datagram");
            return;
        }

        let plaintext = match self.crypto.decrypt_packet(&data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::error!(%from, error = %e, "Dropping undecryptable datagram");
                return;
            }
        };

        let header = match PacketHeader::parse(&plaintext, signature_len) {
            Ok(header) => header,
            Err(e) => {
                tracing::info!(%from, error = %e, "Dropping invalid packet");
                return;
            }
        };

        let (message, signature) = plaintext.split_at(plaintext.len() - signature_len);
        if let Err(e) = self.crypto.verify(message, signature, &header.sender) {
            tracing::info!(%from, sender = %header.sender, error = %e, "Dropping packet with bad signature");
            return;
        }

        let (packet, _) = match packet::parse_body(&header, &plaintext, signature_len) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::info!(%from, error = %e, "Dropping packet with invalid body");
                return;
            }
        };

        tracing::trace!(%from, sender = %packet.sender, packet_type = ?header.packet_type, "Packet accepted");
        self.dispatch(from, packet.sender, packet.body).await;
    }

    async fn dispatch(&self, from: SocketAddr, sender: Identity, body: PacketBody) {
        match body {
            PacketBody::Ping => self.handle_ping(from, sender).await,
            PacketBody::Pong => self.handle_pong(sender),
            PacketBody::PullRequest => self.handle_pull_request(from, sender).await,
            PacketBody::PullResponse { nodes } => self.handle_pull_response(sender, nodes),
            PacketBody::PushRequest => self.handle_push_request(from, sender).await,
            PacketBody::PushChallenge {
                difficulty,
                challenge,
            } => {
                self.handle_push_challenge(from, sender, difficulty, challenge)
                    .await
            }
            PacketBody::Push {
                challenge,
                nonce,
                node,
            } => self.handle_push(sender, challenge, nonce, node),
            PacketBody::Message {
                ttl,
                data_type,
                data,
            } => self.handle_message(from, sender, ttl, data_type, data).await,
        }
    }

    // ── Per-type handlers ──

    async fn handle_ping(&self, from: SocketAddr, sender: Identity) {
        self.send_packet(PacketBody::Pong, from, &sender).await;
    }

    fn handle_pong(&self, sender: Identity) {
        let waiters = self
            .pong_waiters
            .lock()
            .expect("pong waiter lock poisoned");
        if let Some(waiter) = waiters.get(&sender) {
            let _ = waiter.try_send(());
        }
    }

    async fn handle_pull_request(&self, from: SocketAddr, sender: Identity) {
        let nodes = self
            .pull_response_nodes
            .lock()
            .expect("pull response lock poisoned")
            .clone();
        if nodes.is_empty() {
            tracing::debug!(peer = %sender, "No view to answer pull request with");
        } else {
            self.send_packet(PacketBody::PullResponse { nodes }, from, &sender)
                .await;
        }
        self.send_gossip_messages(from, sender).await;
    }

    fn handle_pull_response(&self, sender: Identity, nodes: Vec<Node>) {
        if !self.has_condition(sender, PeerCondition::AllowPull) {
            return;
        }
        // message exchange is earned by answering our pull
        self.add_condition(sender, PeerCondition::AllowMessage);
        for node in nodes {
            self.pull_view.append(node);
        }
    }

    async fn handle_push_request(&self, from: SocketAddr, sender: Identity) {
        let challenge = self.challenger.new_challenge(sender.as_bytes());
        self.send_packet(
            PacketBody::PushChallenge {
                difficulty: self.challenge_difficulty,
                challenge,
            },
            from,
            &sender,
        )
        .await;
    }

    async fn handle_push_challenge(
        &self,
        from: SocketAddr,
        sender: Identity,
        difficulty: u32,
        challenge: [u8; challenge::CHALLENGE_SIZE],
    ) {
        if !self.has_condition(sender, PeerCondition::AllowPushChallenge) {
            return;
        }
        let nonce = match challenge::solve_with_deadline(
            challenge.to_vec(),
            difficulty,
            self.challenge_max_solve,
        )
        .await
        {
            Ok(nonce) => nonce,
            Err(e) => {
                tracing::warn!(peer = %sender, difficulty, error = %e, "Could not solve push challenge");
                return;
            }
        };

        self.send_packet(
            PacketBody::Push {
                challenge,
                nonce,
                node: self.own_node.clone(),
            },
            from,
            &sender,
        )
        .await;
        self.send_gossip_messages(from, sender).await;
    }

    fn handle_push(
        &self,
        sender: Identity,
        challenge: [u8; challenge::CHALLENGE_SIZE],
        nonce: [u8; challenge::NONCE_SIZE],
        node: Node,
    ) {
        // one push attempt per peer per round, spent on receipt
        if self.has_condition(sender, PeerCondition::DenyPush) {
            return;
        }
        self.add_condition(sender, PeerCondition::DenyPush);

        let solved = match self.challenger.is_solved_correctly(
            &challenge,
            &nonce,
            sender.as_bytes(),
            self.challenge_difficulty,
        ) {
            Ok(solved) => solved,
            Err(e) => {
                tracing::error!(peer = %sender, error = %e, "Error during challenge verification");
                return;
            }
        };
        if !solved {
            return;
        }
        if node.identity != sender {
            tracing::warn!(
                sender = %sender,
                pushed = %node.identity,
                "Peer tried pushing a third-party node, rejected"
            );
            return;
        }

        self.add_condition(sender, PeerCondition::AllowMessage);
        self.push_view.append(node);
    }

    async fn handle_message(
        &self,
        from: SocketAddr,
        sender: Identity,
        ttl: u8,
        data_type: u16,
        data: Vec<u8>,
    ) {
        if !self.has_condition(sender, PeerCondition::AllowMessage) {
            return;
        }

        let data_hash = {
            let mut store = self.store.lock().expect("message store lock poisoned");
            match store.on_receive(sender, ttl, data_type, data.clone()) {
                Ok(message) => message.data_hash,
                Err(StoreError::Duplicate) => return,
                Err(e @ StoreError::FloodLimit(_)) => {
                    tracing::info!(source = %sender, source_address = %from, error = %e, "Ignored gossip message to prevent flooding");
                    return;
                }
            }
        };

        // hand the message to API subscribers; a negative validation pulls it
        // back out of the store before it spreads further
        let store = Arc::clone(&self.store);
        self.api
            .notify(data_type, data, move |valid| {
                if !valid {
                    store
                        .lock()
                        .expect("message store lock poisoned")
                        .remove_by_hash(&data_hash);
                }
            })
            .await;
    }

    // ── Outbound ──

    /// Serialize, sign, encrypt, and send a packet. Failures are logged and
    /// swallowed; the round makes progress regardless.
    pub async fn send_packet(
        &self,
        body: PacketBody,
        to: impl tokio::net::ToSocketAddrs,
        recipient: &Identity,
    ) {
        let packet_type = body.packet_type();
        let mut bytes = match packet::serialize(
            &self.own_node.identity,
            &body,
            self.crypto.signature_len(),
        ) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(recipient = %recipient, ?packet_type, error = %e, "Could not build packet");
                return;
            }
        };
        let signature = match self.crypto.sign(&bytes) {
            Ok(signature) => signature,
            Err(e) => {
                tracing::error!(?packet_type, error = %e, "Could not sign packet");
                return;
            }
        };
        bytes.extend_from_slice(&signature);

        let ciphertext = match self.crypto.encrypt_packet(&bytes, recipient) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                tracing::info!(recipient = %recipient, ?packet_type, error = %e, "Could not encrypt packet");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&ciphertext, to).await {
            tracing::warn!(recipient = %recipient, ?packet_type, error = %e, "Could not send packet");
        }
    }

    /// Forward every still-forwardable stored message to a peer we just
    /// completed an exchange with.
    async fn send_gossip_messages(&self, to: SocketAddr, recipient: Identity) {
        let messages = self
            .store
            .lock()
            .expect("message store lock poisoned")
            .forwardable();
        for message in messages {
            self.send_packet(
                PacketBody::Message {
                    ttl: message.ttl,
                    data_type: message.data_type,
                    data: message.data,
                },
                to,
                &recipient,
            )
            .await;
        }
    }

    // ── Peer conditions ──

    fn add_condition(&self, peer: Identity, condition: PeerCondition) {
        self.peer_conditions
            .lock()
            .expect("peer condition lock poisoned")
            .entry(peer)
            .or_default()
            .insert(condition);
    }

    fn has_condition(&self, peer: Identity, condition: PeerCondition) -> bool {
        self.peer_conditions
            .lock()
            .expect("peer condition lock poisoned")
            .get(&peer)
            .is_some_and(|conditions| conditions.contains(&condition))
    }
}
