//! Codec for the local API protocol.
//!
//! Every packet starts with `size: u16 | type: u16` (big-endian); `size`
//! counts the whole packet. Clients send Announce (500), Notify (501), and
//! Validation (503); the server sends Notification (502).

use crate::constants::MAX_PACKET_SIZE;

/// Byte length of the API packet header.
pub const API_HEADER_SIZE: usize = 4;

const GOSSIP_ANNOUNCE: u16 = 500;
const GOSSIP_NOTIFY: u16 = 501;
const GOSSIP_NOTIFICATION: u16 = 502;
const GOSSIP_VALIDATION: u16 = 503;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApiPacketError {
    #[error("packet header could not be parsed, header size invalid")]
    InvalidHeader,
    #[error("packet could not be parsed, type {0} not implemented")]
    UnsupportedType(u16),
    #[error("packet could not be parsed, size in header does not match received data")]
    InvalidSize,
    #[error("packet could not be created, maximum size exceeded")]
    TooLarge,
}

/// Inbound API packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiPacketType {
    Announce,
    Notify,
    Validation,
}

/// Parsed `size | type` prefix of an inbound packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiHeader {
    pub size: u16,
    pub packet_type: ApiPacketType,
}

impl ApiHeader {
    /// Parse the 4-byte prefix. Only client-to-server types are accepted.
    pub fn parse(data: &[u8]) -> Result<Self, ApiPacketError> {
        if data.len() < API_HEADER_SIZE {
            return Err(ApiPacketError::InvalidHeader);
        }
        let size = u16::from_be_bytes([data[0], data[1]]);
        let raw_type = u16::from_be_bytes([data[2], data[3]]);
        let packet_type = match raw_type {
            GOSSIP_ANNOUNCE => ApiPacketType::Announce,
            GOSSIP_NOTIFY => ApiPacketType::Notify,
            GOSSIP_VALIDATION => ApiPacketType::Validation,
            other => return Err(ApiPacketError::UnsupportedType(other)),
        };
        if (size as usize) < API_HEADER_SIZE {
            return Err(ApiPacketError::InvalidSize);
        }
        Ok(ApiHeader { size, packet_type })
    }
}

/// Client request to spread a message through the overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipAnnounce {
    pub ttl: u8,
    pub data_type: u16,
    pub data: Vec<u8>,
}

impl GossipAnnounce {
    /// Parse an Announce packet from its full bytes (header included).
    pub fn parse(header: &ApiHeader, data: &[u8]) -> Result<Self, ApiPacketError> {
        if data.len() != header.size as usize || data.len() < API_HEADER_SIZE + 4 {
            return Err(ApiPacketError::InvalidSize);
        }
        let ttl = data[4];
        // data[5] is the reserved byte
        let data_type = u16::from_be_bytes([data[6], data[7]]);
        Ok(GossipAnnounce {
            ttl,
            data_type,
            data: data[8..].to_vec(),
        })
    }
}

/// Client subscription for messages of one data type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GossipNotify {
    pub data_type: u16,
}

impl GossipNotify {
    pub fn parse(header: &ApiHeader, data: &[u8]) -> Result<Self, ApiPacketError> {
        if header.size != 8 || data.len() != 8 {
            return Err(ApiPacketError::InvalidSize);
        }
        // bytes 4..6 are reserved
        let data_type = u16::from_be_bytes([data[6], data[7]]);
        Ok(GossipNotify { data_type })
    }
}

/// Client verdict on a previously delivered notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GossipValidation {
    pub message_id: u16,
    pub valid: bool,
}

impl GossipValidation {
    pub fn parse(header: &ApiHeader, data: &[u8]) -> Result<Self, ApiPacketError> {
        if header.size != 8 || data.len() != 8 {
            return Err(ApiPacketError::InvalidSize);
        }
        let message_id = u16::from_be_bytes([data[4], data[5]]);
        // 15 reserved bits; the validity flag is the lowest bit of the last
        // byte
        let valid = data[7] & 1 == 1;
        Ok(GossipValidation { message_id, valid })
    }
}

/// Server-to-client delivery of a received gossip message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipNotification {
    pub message_id: u16,
    pub data_type: u16,
    pub data: Vec<u8>,
}

impl GossipNotification {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ApiPacketError> {
        let size = API_HEADER_SIZE + 4 + self.data.len();
        if size > MAX_PACKET_SIZE {
            return Err(ApiPacketError::TooLarge);
        }
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&(size as u16).to_be_bytes());
        bytes.extend_from_slice(&GOSSIP_NOTIFICATION.to_be_bytes());
        bytes.extend_from_slice(&self.message_id.to_be_bytes());
        bytes.extend_from_slice(&self.data_type.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }
}
