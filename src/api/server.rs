//! TCP server for the local application API.
//!
//! One owner task holds all mutable API state (subscriptions, pending
//! validation callbacks, the outgoing message-id counter); connection tasks
//! and the gossip side talk to it through channels, so no state is shared
//! behind locks and no back-pointers exist between the API server and the
//! gossip server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::packet::{
    ApiHeader, ApiPacketType, GossipAnnounce, GossipNotification, GossipNotify, GossipValidation,
    API_HEADER_SIZE,
};
use crate::constants::VALIDATION_WINDOW;
use crate::gossip::node::Identity;
use crate::gossip::store::{MessageStore, StoreError};

/// Fatal API server startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("could not bind API server on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

/// Verdict callback attached to a notification.
type ValidationCallback = Box<dyn FnOnce(bool) + Send>;

/// The gossip side's capability to the API server.
#[derive(Clone)]
pub struct ApiHandle {
    commands: mpsc::Sender<ApiCommand>,
}

impl ApiHandle {
    /// Deliver a received message to subscribers of its data type. The
    /// callback fires when a client sends a validation verdict within the
    /// validation window.
    pub async fn notify(
        &self,
        data_type: u16,
        data: Vec<u8>,
        validation: impl FnOnce(bool) + Send + 'static,
    ) {
        let _ = self
            .commands
            .send(ApiCommand::Notify {
                data_type,
                data,
                validation: Box::new(validation),
            })
            .await;
    }

    /// A handle with no server behind it; notifications vanish. Test seam.
    pub fn detached() -> ApiHandle {
        let (commands, _) = mpsc::channel(1);
        ApiHandle { commands }
    }
}

enum ApiCommand {
    Notify {
        data_type: u16,
        data: Vec<u8>,
        validation: ValidationCallback,
    },
}

enum ConnEvent {
    Connected {
        conn_id: u64,
        writer: mpsc::Sender<Vec<u8>>,
    },
    Subscribe {
        conn_id: u64,
        data_type: u16,
    },
    Announce {
        ttl: u8,
        data_type: u16,
        data: Vec<u8>,
    },
    Validation {
        message_id: u16,
        valid: bool,
    },
    Disconnected {
        conn_id: u64,
    },
}

struct PendingValidation {
    message_id: u16,
    created: Instant,
    callback: ValidationCallback,
}

/// Start the API server. Returns the handle the gossip server uses to push
/// notifications.
pub async fn start(
    address: &str,
    store: Arc<Mutex<MessageStore>>,
    own_identity: Identity,
    shutdown: CancellationToken,
) -> Result<ApiHandle, ApiError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| ApiError::Bind {
            address: address.to_string(),
            source,
        })?;
    tracing::info!(address, "API server listening");

    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    tokio::spawn(accept_loop(listener, events_tx, shutdown.clone()));
    tokio::spawn(owner_loop(
        commands_rx,
        events_rx,
        store,
        own_identity,
        shutdown,
    ));

    Ok(ApiHandle {
        commands: commands_tx,
    })
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<ConnEvent>,
    shutdown: CancellationToken,
) {
    let mut next_conn_id = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Error accepting API connection");
                        continue;
                    }
                };
                let conn_id = next_conn_id;
                next_conn_id += 1;
                tracing::info!(client_address = %peer_addr, conn_id, "New API client connected");

                let (read_half, mut write_half) = stream.into_split();
                let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(16);
                if events
                    .send(ConnEvent::Connected { conn_id, writer: writer_tx })
                    .await
                    .is_err()
                {
                    break;
                }

                tokio::spawn(async move {
                    while let Some(bytes) = writer_rx.recv().await {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            tracing::warn!(conn_id, error = %e, "Could not send to API client");
                            break;
                        }
                    }
                });
                tokio::spawn(connection_loop(conn_id, read_half, events.clone(), shutdown.clone()));
            }
        }
    }
}

/// Read length-prefixed packets off one client connection and turn them into
/// events. A framing error abandons the connection; there is no way to
/// resynchronize a byte stream with a corrupt length prefix.
async fn connection_loop(
    conn_id: u64,
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<ConnEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let mut header_bytes = [0u8; API_HEADER_SIZE];
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = read_half.read_exact(&mut header_bytes) => {
                if read.is_err() {
                    break;
                }
            }
        }

        let header = match ApiHeader::parse(&header_bytes) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "Invalid packet from API client");
                break;
            }
        };

        let mut packet = vec![0u8; header.size as usize];
        packet[..API_HEADER_SIZE].copy_from_slice(&header_bytes);
        if header.size as usize > API_HEADER_SIZE
            && read_half
                .read_exact(&mut packet[API_HEADER_SIZE..])
                .await
                .is_err()
        {
            break;
        }

        let event = match header.packet_type {
            ApiPacketType::Announce => match GossipAnnounce::parse(&header, &packet) {
                Ok(announce) => ConnEvent::Announce {
                    ttl: announce.ttl,
                    data_type: announce.data_type,
                    data: announce.data,
                },
                Err(e) => {
                    tracing::warn!(conn_id, error = %e, "Could not parse GossipAnnounce packet");
                    continue;
                }
            },
            ApiPacketType::Notify => match GossipNotify::parse(&header, &packet) {
                Ok(notify) => ConnEvent::Subscribe {
                    conn_id,
                    data_type: notify.data_type,
                },
                Err(e) => {
                    tracing::warn!(conn_id, error = %e, "Could not parse GossipNotify packet");
                    continue;
                }
            },
            ApiPacketType::Validation => match GossipValidation::parse(&header, &packet) {
                Ok(validation) => ConnEvent::Validation {
                    message_id: validation.message_id,
                    valid: validation.valid,
                },
                Err(e) => {
                    tracing::warn!(conn_id, error = %e, "Could not parse GossipValidation packet");
                    continue;
                }
            },
        };
        if events.send(event).await.is_err() {
            break;
        }
    }

    let _ = events.send(ConnEvent::Disconnected { conn_id }).await;
    tracing::info!(conn_id, "API client disconnected");
}

/// The single owner of subscriptions, pending validations, and the outgoing
/// message-id counter.
async fn owner_loop(
    mut commands: mpsc::Receiver<ApiCommand>,
    mut events: mpsc::Receiver<ConnEvent>,
    store: Arc<Mutex<MessageStore>>,
    own_identity: Identity,
    shutdown: CancellationToken,
) {
    let mut writers: HashMap<u64, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut subscriptions: HashMap<u16, Vec<u64>> = HashMap::new();
    let mut pending: Vec<PendingValidation> = Vec::new();
    let mut next_message_id = 0u16;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(command) = commands.recv() => match command {
                ApiCommand::Notify { data_type, data, validation } => {
                    // stale callbacks are dropped at dispatch, not by a timer
                    pending.retain(|p| p.created.elapsed() <= VALIDATION_WINDOW);

                    let Some(subscribers) = subscriptions.get(&data_type).filter(|s| !s.is_empty())
                    else {
                        tracing::info!(data_type, "No API client registered for this data type");
                        continue;
                    };

                    let message_id = next_message_id;
                    next_message_id = next_message_id.wrapping_add(1);
                    let notification = GossipNotification { message_id, data_type, data };
                    let bytes = match notification.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::error!(error = %e, "Error building gossip notification packet");
                            continue;
                        }
                    };
                    for conn_id in subscribers {
                        if let Some(writer) = writers.get(conn_id) {
                            if writer.try_send(bytes.clone()).is_err() {
                                tracing::warn!(conn_id, "API client not keeping up, notification dropped");
                            }
                        }
                    }
                    pending.push(PendingValidation {
                        message_id,
                        created: Instant::now(),
                        callback: validation,
                    });
                }
            },
            Some(event) = events.recv() => match event {
                ConnEvent::Connected { conn_id, writer } => {
                    writers.insert(conn_id, writer);
                }
                ConnEvent::Subscribe { conn_id, data_type } => {
                    let subscribers = subscriptions.entry(data_type).or_default();
                    if !subscribers.contains(&conn_id) {
                        subscribers.push(conn_id);
                    }
                    tracing::debug!(conn_id, data_type, "API client subscribed");
                }
                ConnEvent::Announce { ttl, data_type, data } => {
                    let result = store
                        .lock()
                        .expect("message store lock poisoned")
                        .spread(ttl, data_type, data, own_identity)
                        .map(|_| ());
                    match result {
                        Ok(()) => tracing::debug!(data_type, ttl, "Message announced for spreading"),
                        Err(StoreError::Duplicate) => {
                            tracing::debug!(data_type, "Announced message already known");
                        }
                        Err(e) => tracing::info!(data_type, error = %e, "Announced message refused"),
                    }
                }
                ConnEvent::Validation { message_id, valid } => {
                    if let Some(index) = pending.iter().position(|p| p.message_id == message_id) {
                        let handler = pending.swap_remove(index);
                        (handler.callback)(valid);
                    }
                }
                ConnEvent::Disconnected { conn_id } => {
                    writers.remove(&conn_id);
                    for subscribers in subscriptions.values_mut() {
                        subscribers.retain(|&id| id != conn_id);
                    }
                }
            },
            else => break,
        }
    }
}
