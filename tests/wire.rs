//! Wire-level properties of the authenticated packet pipeline: the exact
//! byte layout of serialized packets, and the full
//! serialize → sign → encrypt → decrypt → verify → parse path between two
//! keyrings.

use std::path::Path;

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPrivateKey;

use murmur::challenge::{CHALLENGE_SIZE, NONCE_SIZE};
use murmur::gossip::crypto::{identity_of, Crypto};
use murmur::gossip::node::{Identity, Node};
use murmur::gossip::packet::{parse_body, serialize, PacketBody, PacketHeader, HEADER_SIZE};
use murmur::sha256;

fn write_hostkey(dir: &Path, key: &RsaPrivateKey) {
    let public = key.to_public_key();
    let pem = public.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
    std::fs::write(dir.join(identity_of(&public).to_string()), pem).unwrap();
}

/// Two crypto endpoints that know each other's public keys.
fn paired_cryptos() -> (Crypto, Crypto, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let key_a = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let key_b = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    write_hostkey(dir.path(), &key_a);
    write_hostkey(dir.path(), &key_b);
    let a = Crypto::new(key_a, dir.path()).unwrap();
    let b = Crypto::new(key_b, dir.path()).unwrap();
    (a, b, dir)
}

/// Build the full signed plaintext a sender would encrypt.
fn signed_packet(crypto: &Crypto, body: &PacketBody) -> Vec<u8> {
    let mut bytes = serialize(&crypto.identity(), body, crypto.signature_len()).unwrap();
    let signature = crypto.sign(&bytes).unwrap();
    bytes.extend_from_slice(&signature);
    bytes
}

/// Receive as the gossip endpoint does: decrypt, parse the header, verify
/// the signature over everything but the footer, parse the body.
fn receive(
    crypto: &Crypto,
    datagram: &[u8],
) -> Result<(Identity, PacketBody), Box<dyn std::error::Error>> {
    let plaintext = crypto.decrypt_packet(datagram)?;
    let signature_len = crypto.signature_len();
    let header = PacketHeader::parse(&plaintext, signature_len)?;
    let (message, signature) = plaintext.split_at(plaintext.len() - signature_len);
    crypto.verify(message, signature, &header.sender)?;
    let (packet, _) = parse_body(&header, &plaintext, signature_len)?;
    Ok((packet.sender, packet.body))
}

fn all_bodies() -> Vec<PacketBody> {
    let node = Node::new(Identity::from(sha256(b"pushed")), "10.1.2.3:7002");
    vec![
        PacketBody::Ping,
        PacketBody::Pong,
        PacketBody::PullRequest,
        PacketBody::PushRequest,
        PacketBody::PullResponse {
            nodes: vec![
                Node::new(Identity::from(sha256(b"one")), "10.0.0.1:7002"),
                Node::new(Identity::from(sha256(b"two")), "10.0.0.2:7002"),
            ],
        },
        PacketBody::PushChallenge {
            difficulty: 19,
            challenge: sha256(b"challenge"),
        },
        PacketBody::Push {
            challenge: sha256(b"challenge"),
            nonce: 42u64.to_be_bytes(),
            node: node.clone(),
        },
        PacketBody::Message {
            ttl: 7,
            data_type: 0xBEEF,
            data: b"payload".to_vec(),
        },
    ]
}

#[test]
fn every_packet_type_survives_the_full_pipeline() {
    let (alice, bob, _dir) = paired_cryptos();

    for body in all_bodies() {
        let plaintext = signed_packet(&alice, &body);
        let datagram = alice.encrypt_packet(&plaintext, &bob.identity()).unwrap();
        let (sender, received) = receive(&bob, &datagram).unwrap();
        assert_eq!(sender, alice.identity());
        assert_eq!(received, body);
    }
}

#[test]
fn header_layout_is_size_type_sender() {
    let (alice, _bob, _dir) = paired_cryptos();
    let sig_len = alice.signature_len();
    let bytes = serialize(&alice.identity(), &PacketBody::Ping, sig_len).unwrap();

    assert_eq!(bytes.len(), HEADER_SIZE);
    let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    assert_eq!(declared, HEADER_SIZE + sig_len);
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 0x0030);
    assert_eq!(&bytes[4..36], alice.identity().as_bytes());
}

#[test]
fn push_layout_is_challenge_nonce_node() {
    let sender = Identity::from(sha256(b"sender"));
    let pushed = Identity::from(sha256(b"pushed"));
    let body = PacketBody::Push {
        challenge: [0xCC; CHALLENGE_SIZE],
        nonce: [0xDD; NONCE_SIZE],
        node: Node::new(pushed, "h:1"),
    };
    let bytes = serialize(&sender, &body, 0).unwrap();

    let mut offset = HEADER_SIZE;
    assert_eq!(&bytes[offset..offset + CHALLENGE_SIZE], &[0xCC; 32]);
    offset += CHALLENGE_SIZE;
    assert_eq!(&bytes[offset..offset + NONCE_SIZE], &[0xDD; 8]);
    offset += NONCE_SIZE;
    assert_eq!(&bytes[offset..offset + 32], pushed.as_bytes());
    offset += 32;
    assert_eq!(bytes[offset], b'\t');
    assert_eq!(&bytes[offset + 1..offset + 4], b"h:1");
    assert_eq!(bytes[offset + 4], b'\n');
    assert_eq!(bytes.len(), offset + 5);
}

#[test]
fn message_layout_is_ttl_reserved_datatype_data() {
    let sender = Identity::from(sha256(b"sender"));
    let body = PacketBody::Message {
        ttl: 3,
        data_type: 0x1234,
        data: b"hi".to_vec(),
    };
    let bytes = serialize(&sender, &body, 0).unwrap();

    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 0x0060);
    assert_eq!(bytes[HEADER_SIZE], 3);
    assert_eq!(bytes[HEADER_SIZE + 1], 0x00);
    assert_eq!(
        u16::from_be_bytes([bytes[HEADER_SIZE + 2], bytes[HEADER_SIZE + 3]]),
        0x1234
    );
    assert_eq!(&bytes[HEADER_SIZE + 4..], b"hi");
}

#[test]
fn tampered_datagram_is_rejected_by_decryption() {
    let (alice, bob, _dir) = paired_cryptos();
    let plaintext = signed_packet(&alice, &PacketBody::Ping);
    let mut datagram = alice.encrypt_packet(&plaintext, &bob.identity()).unwrap();

    // flipping any ciphertext bit breaks GCM authentication
    let mid = datagram.len() / 2;
    datagram[mid] ^= 0x01;
    assert!(receive(&bob, &datagram).is_err());
}

#[test]
fn forged_sender_identity_is_rejected_by_verification() {
    let (alice, bob, _dir) = paired_cryptos();

    // a signed packet claiming bob's identity but signed with alice's key
    let mut bytes = serialize(&bob.identity(), &PacketBody::Ping, alice.signature_len()).unwrap();
    let signature = alice.sign(&bytes).unwrap();
    bytes.extend_from_slice(&signature);
    let datagram = alice.encrypt_packet(&bytes, &bob.identity()).unwrap();

    assert!(receive(&bob, &datagram).is_err());
}

#[test]
fn unknown_sender_identity_is_rejected() {
    let (alice, bob, _dir) = paired_cryptos();

    let stranger = Identity::from(sha256(b"nobody"));
    let mut bytes = serialize(&stranger, &PacketBody::Ping, alice.signature_len()).unwrap();
    let signature = alice.sign(&bytes).unwrap();
    bytes.extend_from_slice(&signature);
    let datagram = alice.encrypt_packet(&bytes, &bob.identity()).unwrap();

    assert!(receive(&bob, &datagram).is_err());
}

#[test]
fn datagram_for_another_recipient_cannot_be_read() {
    let (alice, bob, _dir) = paired_cryptos();
    let plaintext = signed_packet(&alice, &PacketBody::Ping);
    let datagram = alice.encrypt_packet(&plaintext, &alice.identity()).unwrap();
    // bob cannot unwrap a packet key encrypted to alice
    assert!(receive(&bob, &datagram).is_err());
}

#[test]
fn signature_is_over_the_packet_without_its_footer() {
    let (alice, bob, _dir) = paired_cryptos();
    let body = PacketBody::Message {
        ttl: 1,
        data_type: 7,
        data: b"x".to_vec(),
    };
    let plaintext = signed_packet(&alice, &body);
    let sig_len = alice.signature_len();

    let (message, signature) = plaintext.split_at(plaintext.len() - sig_len);
    bob.verify(message, signature, &alice.identity()).unwrap();
    // including the footer in the signed range must fail
    assert!(bob
        .verify(&plaintext, signature, &alice.identity())
        .is_err());
}
