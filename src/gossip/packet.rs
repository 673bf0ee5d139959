//! Wire codec for the eight peer-to-peer packet types.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! Header (36)        = Size u16 | Type u16 | SenderIdentity [32]
//! Footer             = Signature [N]        (N = RSA signature length)
//! Ping/Pong/PullReq/PushReq = Header | Footer
//! PullResponse       = Header | Node* | Footer
//!   Node             = Identity [32] | 0x09 | Address | 0x0A
//! PushChallenge      = Header | Difficulty u32 | Challenge [32] | Footer
//! Push               = Header | Challenge [32] | Nonce [8] | Node | Footer
//! Message            = Header | TTL u8 | Reserved u8 | DataType u16 | Data | Footer
//! ```
//!
//! `Size` counts the whole plaintext packet including the signature footer.
//! The node encoding keeps its historical tab/newline delimiters; parsing
//! consumes the fixed 32 identity bytes first, so delimiter bytes inside an
//! identity cannot confuse it.

use crate::challenge::{CHALLENGE_SIZE, NONCE_SIZE};
use crate::constants::{IDENTITY_SIZE, MAX_PACKET_SIZE};
use crate::gossip::node::{Identity, Node};

/// Byte length of the fixed packet header.
pub const HEADER_SIZE: usize = 36;

const NODE_TAB: u8 = 0x09;
const NODE_NEWLINE: u8 = 0x0A;

/// Errors refusing a packet at the codec layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short for header and signature")]
    Truncated,
    #[error("unsupported packet type {0:#06x}")]
    UnsupportedType(u16),
    #[error("size field {declared} does not match packet length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("packet exceeds maximum size of {MAX_PACKET_SIZE} bytes")]
    TooLarge,
    #[error("malformed node encoding")]
    MalformedNode,
    #[error("malformed packet body: {0}")]
    MalformedBody(&'static str),
}

/// The eight P2P packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Ping = 0x0030,
    Pong = 0x0031,
    PullRequest = 0x0040,
    PullResponse = 0x0041,
    PushRequest = 0x0050,
    PushChallenge = 0x0051,
    Push = 0x0052,
    Message = 0x0060,
}

impl PacketType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0030 => Some(PacketType::Ping),
            0x0031 => Some(PacketType::Pong),
            0x0040 => Some(PacketType::PullRequest),
            0x0041 => Some(PacketType::PullResponse),
            0x0050 => Some(PacketType::PushRequest),
            0x0051 => Some(PacketType::PushChallenge),
            0x0052 => Some(PacketType::Push),
            0x0060 => Some(PacketType::Message),
            _ => None,
        }
    }
}

/// The parsed fixed-layout header shared by all packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u16,
    pub packet_type: PacketType,
    pub sender: Identity,
}

impl PacketHeader {
    /// Parse the header of a decrypted packet and validate the size field
    /// against the actual packet length.
    pub fn parse(plaintext: &[u8], signature_len: usize) -> Result<Self, PacketError> {
        if plaintext.len() < HEADER_SIZE + signature_len {
            return Err(PacketError::Truncated);
        }
        let size = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        let raw_type = u16::from_be_bytes([plaintext[2], plaintext[3]]);
        let packet_type =
            PacketType::from_u16(raw_type).ok_or(PacketError::UnsupportedType(raw_type))?;
        if size as usize != plaintext.len() {
            return Err(PacketError::SizeMismatch {
                declared: size as usize,
                actual: plaintext.len(),
            });
        }
        let sender = Identity::from_bytes(&plaintext[4..HEADER_SIZE])
            .expect("header slice has identity length");
        Ok(PacketHeader {
            size,
            packet_type,
            sender,
        })
    }
}

/// Packet body, one variant per wire type.
#[derive(Clone, Debug, PartialEq)]
pub enum PacketBody {
    Ping,
    Pong,
    PullRequest,
    PullResponse {
        nodes: Vec<Node>,
    },
    PushRequest,
    PushChallenge {
        difficulty: u32,
        challenge: [u8; CHALLENGE_SIZE],
    },
    Push {
        challenge: [u8; CHALLENGE_SIZE],
        nonce: [u8; NONCE_SIZE],
        node: Node,
    },
    Message {
        ttl: u8,
        data_type: u16,
        data: Vec<u8>,
    },
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::Ping => PacketType::Ping,
            PacketBody::Pong => PacketType::Pong,
            PacketBody::PullRequest => PacketType::PullRequest,
            PacketBody::PullResponse { .. } => PacketType::PullResponse,
            PacketBody::PushRequest => PacketType::PushRequest,
            PacketBody::PushChallenge { .. } => PacketType::PushChallenge,
            PacketBody::Push { .. } => PacketType::Push,
            PacketBody::Message { .. } => PacketType::Message,
        }
    }
}

/// A fully parsed packet: sender identity plus typed body.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub sender: Identity,
    pub body: PacketBody,
}

/// Serialize a packet without its signature footer.
///
/// The size field accounts for the `signature_len` bytes the caller appends
/// after signing. Fails with [`PacketError::TooLarge`] when the total would
/// exceed the maximum datagram size.
pub fn serialize(
    sender: &Identity,
    body: &PacketBody,
    signature_len: usize,
) -> Result<Vec<u8>, PacketError> {
    let mut payload = Vec::new();
    match body {
        PacketBody::Ping | PacketBody::Pong | PacketBody::PullRequest | PacketBody::PushRequest => {
        }
        PacketBody::PullResponse { nodes } => {
            for node in nodes {
                write_node(&mut payload, node);
            }
        }
        PacketBody::PushChallenge {
            difficulty,
            challenge,
        } => {
            payload.extend_from_slice(&difficulty.to_be_bytes());
            payload.extend_from_slice(challenge);
        }
        PacketBody::Push {
            challenge,
            nonce,
            node,
        } => {
            payload.extend_from_slice(challenge);
            payload.extend_from_slice(nonce);
            write_node(&mut payload, node);
        }
        PacketBody::Message {
            ttl,
            data_type,
            data,
        } => {
            payload.push(*ttl);
            payload.push(0x00);
            payload.extend_from_slice(&data_type.to_be_bytes());
            payload.extend_from_slice(data);
        }
    }

    let total = HEADER_SIZE + payload.len() + signature_len;
    if total > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge);
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&(total as u16).to_be_bytes());
    bytes.extend_from_slice(&(body.packet_type() as u16).to_be_bytes());
    bytes.extend_from_slice(sender.as_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parse the body of a decrypted packet whose header was already validated.
///
/// Returns the typed packet and the signature footer bytes.
pub fn parse_body(
    header: &PacketHeader,
    plaintext: &[u8],
    signature_len: usize,
) -> Result<(Packet, Vec<u8>), PacketError> {
    let body_end = plaintext.len() - signature_len;
    let mut body_bytes = &plaintext[HEADER_SIZE..body_end];
    let signature = plaintext[body_end..].to_vec();

    let body = match header.packet_type {
        PacketType::Ping => {
            expect_empty(body_bytes)?;
            PacketBody::Ping
        }
        PacketType::Pong => {
            expect_empty(body_bytes)?;
            PacketBody::Pong
        }
        PacketType::PullRequest => {
            expect_empty(body_bytes)?;
            PacketBody::PullRequest
        }
        PacketType::PushRequest => {
            expect_empty(body_bytes)?;
            PacketBody::PushRequest
        }
        PacketType::PullResponse => {
            if body_bytes.is_empty() {
                return Err(PacketError::MalformedBody("pull response without nodes"));
            }
            let mut nodes = Vec::new();
            while !body_bytes.is_empty() {
                nodes.push(read_node(&mut body_bytes)?);
            }
            PacketBody::PullResponse { nodes }
        }
        PacketType::PushChallenge => {
            if body_bytes.len() != 4 + CHALLENGE_SIZE {
                return Err(PacketError::MalformedBody("push challenge length mismatch"));
            }
            let difficulty =
                u32::from_be_bytes(body_bytes[..4].try_into().expect("length checked"));
            let challenge = body_bytes[4..].try_into().expect("length checked");
            PacketBody::PushChallenge {
                difficulty,
                challenge,
            }
        }
        PacketType::Push => {
            if body_bytes.len() < CHALLENGE_SIZE + NONCE_SIZE {
                return Err(PacketError::MalformedBody("push body too short"));
            }
            let challenge = body_bytes[..CHALLENGE_SIZE]
                .try_into()
                .expect("length checked");
            let nonce = body_bytes[CHALLENGE_SIZE..CHALLENGE_SIZE + NONCE_SIZE]
                .try_into()
                .expect("length checked");
            body_bytes = &body_bytes[CHALLENGE_SIZE + NONCE_SIZE..];
            let node = read_node(&mut body_bytes)?;
            if !body_bytes.is_empty() {
                return Err(PacketError::MalformedBody("push carries more than one node"));
            }
            PacketBody::Push {
                challenge,
                nonce,
                node,
            }
        }
        PacketType::Message => {
            if body_bytes.len() < 4 {
                return Err(PacketError::MalformedBody("message body too short"));
            }
            let ttl = body_bytes[0];
            // body_bytes[1] is the reserved byte
            let data_type = u16::from_be_bytes([body_bytes[2], body_bytes[3]]);
            let data = body_bytes[4..].to_vec();
            PacketBody::Message {
                ttl,
                data_type,
                data,
            }
        }
    };

    Ok((
        Packet {
            sender: header.sender,
            body,
        },
        signature,
    ))
}

fn expect_empty(body_bytes: &[u8]) -> Result<(), PacketError> {
    if body_bytes.is_empty() {
        Ok(())
    } else {
        Err(PacketError::MalformedBody("unexpected trailing bytes"))
    }
}

fn write_node(buf: &mut Vec<u8>, node: &Node) {
    buf.extend_from_slice(node.identity.as_bytes());
    buf.push(NODE_TAB);
    buf.extend_from_slice(node.address.as_bytes());
    buf.push(NODE_NEWLINE);
}

fn read_node(cursor: &mut &[u8]) -> Result<Node, PacketError> {
    if cursor.len() < IDENTITY_SIZE + 2 {
        return Err(PacketError::MalformedNode);
    }
    let identity = Identity::from_bytes(&cursor[..IDENTITY_SIZE])
        .expect("cursor slice has identity length");
    if cursor[IDENTITY_SIZE] != NODE_TAB {
        return Err(PacketError::MalformedNode);
    }
    let rest = &cursor[IDENTITY_SIZE + 1..];
    let end = rest
        .iter()
        .position(|&b| b == NODE_NEWLINE)
        .ok_or(PacketError::MalformedNode)?;
    let address =
        String::from_utf8(rest[..end].to_vec()).map_err(|_| PacketError::MalformedNode)?;
    *cursor = &rest[end + 1..];
    Ok(Node { identity, address })
}
