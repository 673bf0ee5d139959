#![no_main]

use libfuzzer_sys::fuzz_target;
use murmur::gossip::packet::{parse_body, PacketHeader};

fuzz_target!(|data: &[u8]| {
    // The P2P parser sees attacker-controlled bytes after decryption. It must
    // never panic: anything malformed is an Err that drops the packet.
    for sig_len in [0usize, 64, 512] {
        if let Ok(header) = PacketHeader::parse(data, sig_len) {
            let _ = parse_body(&header, data, sig_len);
        }
    }
});
