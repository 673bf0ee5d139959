#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur::api::packet::{ApiHeader, ApiPacketType, GossipAnnounce, GossipNotify, GossipValidation};

fuzz_target!(|data: &[u8]| {
    // Local API clients are untrusted processes; the parser must reject
    // malformed packets without panicking.
    if let Ok(header) = ApiHeader::parse(data) {
        match header.packet_type {
            ApiPacketType::Announce => {
                let _ = GossipAnnounce::parse(&header, data);
            }
            ApiPacketType::Notify => {
                let _ = GossipNotify::parse(&header, data);
            }
            ApiPacketType::Validation => {
                let _ = GossipValidation::parse(&header, data);
            }
        }
    }
});
