//! Murmur overlay simulator
//!
//! A standalone binary that spins up real gossip nodes over loopback UDP
//! with full keyrings and push challenges, checks membership convergence and
//! message dissemination, and runs attack scenarios from a malicious actor.
//!
//! Usage: cargo run --bin simulator

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colored::Colorize;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPrivateKey;
use tokio_util::sync::CancellationToken;

use murmur::api;
use murmur::challenge::Challenger;
use murmur::config::GossipConfig;
use murmur::gossip::crypto::{identity_of, Crypto};
use murmur::gossip::engine::Gossip;
use murmur::gossip::node::{Identity, Node};
use murmur::gossip::packet::{serialize, PacketBody};
use murmur::gossip::sampler::SamplerGroup;
use murmur::gossip::server::Server;
use murmur::gossip::store::MessageStore;

// ── Configuration ──

const NUM_NODES: usize = 5;
const ROUND_INTERVAL: Duration = Duration::from_millis(250);
const CHALLENGE_DIFFICULTY: u32 = 4;

/// Result of a single scenario.
struct ScenarioResult {
    name: String,
    passed: bool,
    detail: String,
}

impl ScenarioResult {
    fn pass(name: &str, detail: String) -> Self {
        ScenarioResult {
            name: name.to_string(),
            passed: true,
            detail,
        }
    }
    fn fail(name: &str, detail: String) -> Self {
        ScenarioResult {
            name: name.to_string(),
            passed: false,
            detail,
        }
    }
}

struct SimNode {
    identity: Identity,
    address: String,
    server: Arc<Server>,
    samplers: Arc<Mutex<SamplerGroup>>,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    println!("\n{}", "========================================".bright_cyan());
    println!("{}", "       MURMUR OVERLAY SIMULATOR".bright_cyan().bold());
    println!("{}\n", "========================================".bright_cyan());

    let mut results = Vec::new();
    let hostkeys = scratch_dir();

    // ── Phase 1: bootstrap a ring of nodes ──
    println!("{}", "[Phase 1] Bootstrapping overlay...".yellow());
    let keys: Vec<RsaPrivateKey> = (0..NUM_NODES)
        .map(|_| register_member_key(&hostkeys))
        .collect();
    let addresses: Vec<String> = (0..NUM_NODES).map(|_| free_udp_address()).collect();
    let identities: Vec<Identity> = keys
        .iter()
        .map(|k| identity_of(&k.to_public_key()))
        .collect();

    let mut nodes = Vec::new();
    for (index, key) in keys.into_iter().enumerate() {
        // ring topology: each node bootstraps with its successor
        let next = (index + 1) % NUM_NODES;
        let bootstrap = vec![Node::new(identities[next], addresses[next].clone())];
        nodes.push(spawn_node(&hostkeys, key, addresses[index].clone(), bootstrap).await);
    }
    println!(
        "  {} {} nodes listening on loopback UDP",
        "OK".green().bold(),
        NUM_NODES
    );
    results.push(ScenarioResult::pass(
        "Overlay Bootstrap",
        format!("{NUM_NODES} nodes online"),
    ));

    // ── Phase 2: membership convergence ──
    println!("{}", "[Phase 2] Waiting for membership convergence...".yellow());
    let target = NUM_NODES - 1;
    let converged = wait_until(Duration::from_secs(30), || {
        nodes.iter().all(|node| distinct_peers(node) >= target)
    })
    .await;
    let spread: Vec<usize> = nodes.iter().map(distinct_peers).collect();
    if converged {
        println!(
            "  {} every node sampled all {} peers {:?}",
            "OK".green().bold(),
            target,
            spread
        );
        results.push(ScenarioResult::pass(
            "Membership Convergence",
            format!("sampled peers per node: {spread:?}"),
        ));
    } else {
        println!("  {} convergence incomplete {:?}", "FAIL".red().bold(), spread);
        results.push(ScenarioResult::fail(
            "Membership Convergence",
            format!("sampled peers per node: {spread:?}"),
        ));
    }

    // ── Phase 3: message dissemination ──
    println!("{}", "[Phase 3] Disseminating a gossip message...".yellow());
    let payload = b"simulator broadcast".to_vec();
    {
        let origin = &nodes[0];
        let _ = origin
            .server
            .store()
            .lock()
            .expect("store lock")
            .spread(0, 0x5150, payload.clone(), origin.identity);
    }
    let all_received = wait_until(Duration::from_secs(30), || {
        nodes.iter().skip(1).all(|node| {
            node.server
                .store()
                .lock()
                .expect("store lock")
                .messages()
                .iter()
                .any(|m| m.data == payload)
        })
    })
    .await;
    if all_received {
        println!(
            "  {} message reached all {} other nodes",
            "OK".green().bold(),
            NUM_NODES - 1
        );
        results.push(ScenarioResult::pass(
            "Message Dissemination",
            format!("{} receivers", NUM_NODES - 1),
        ));
    } else {
        let receivers = nodes
            .iter()
            .skip(1)
            .filter(|node| {
                node.server
                    .store()
                    .lock()
                    .expect("store lock")
                    .messages()
                    .iter()
                    .any(|m| m.data == payload)
            })
            .count();
        println!(
            "  {} only {}/{} nodes received the message",
            "FAIL".red().bold(),
            receivers,
            NUM_NODES - 1
        );
        results.push(ScenarioResult::fail(
            "Message Dissemination",
            format!("{receivers}/{} receivers", NUM_NODES - 1),
        ));
    }

    // ── Phase 4: malicious pushes ──
    println!("{}", "[Phase 4] Attacking with unsolicited pushes...".yellow());
    let attack = attack_with_forged_pushes(&hostkeys, &nodes).await;
    let victim_planted = wait_until(Duration::from_secs(3), || {
        nodes.iter().any(|node| {
            node.samplers
                .lock()
                .expect("sampler lock")
                .sample_all()
                .iter()
                .any(|n| n.identity == attack.victim)
                || node
                    .server
                    .push_view()
                    .get_all()
                    .iter()
                    .any(|n| n.identity == attack.victim)
        })
    })
    .await;
    if victim_planted {
        println!(
            "  {} a fabricated identity entered a node's views",
            "FAIL".red().bold()
        );
        results.push(ScenarioResult::fail(
            "Push Attack Resistance",
            "fabricated identity accepted".to_string(),
        ));
    } else {
        println!(
            "  {} {} forged pushes and {} garbage datagrams, none accepted",
            "OK".green().bold(),
            attack.forged_pushes,
            attack.garbage_datagrams
        );
        results.push(ScenarioResult::pass(
            "Push Attack Resistance",
            format!(
                "{} forged pushes, {} garbage datagrams rejected",
                attack.forged_pushes, attack.garbage_datagrams
            ),
        ));
    }

    // ── Phase 5: node failure and history purge ──
    println!("{}", "[Phase 5] Killing a node, awaiting purge...".yellow());
    let dead = nodes.pop().expect("nodes available");
    let dead_identity = dead.identity;
    dead.shutdown.cancel();
    drop(dead);

    let purged = wait_until(Duration::from_secs(30), || {
        nodes.iter().all(|node| {
            !node
                .samplers
                .lock()
                .expect("sampler lock")
                .sample_all()
                .iter()
                .any(|n| n.identity == dead_identity)
        })
    })
    .await;
    if purged {
        println!(
            "  {} dead node purged from every sampler group",
            "OK".green().bold()
        );
        results.push(ScenarioResult::pass(
            "Liveness Purge",
            "dead node reseeded out of all samplers".to_string(),
        ));
    } else {
        println!(
            "  {} dead node still sampled somewhere",
            "FAIL".red().bold()
        );
        results.push(ScenarioResult::fail(
            "Liveness Purge",
            "dead node survived the ping passes".to_string(),
        ));
    }

    for node in &nodes {
        node.shutdown.cancel();
    }
    print_summary(&results);
    let _ = std::fs::remove_dir_all(&hostkeys);
    if results.iter().any(|r| !r.passed) {
        std::process::exit(1);
    }
}

// ── Node harness ──

async fn spawn_node(
    hostkeys: &Path,
    private_key: RsaPrivateKey,
    address: String,
    bootstrap_nodes: Vec<Node>,
) -> SimNode {
    let cfg = GossipConfig {
        view_size: 4,
        sampler_size: 16,
        alpha: 0.45,
        beta: 0.45,
        gamma: 0.10,
        api_address: free_tcp_address(),
        gossip_address: address.clone(),
        bootstrap_nodes,
        rounds_between_pings: 4,
        hostkeys_path: hostkeys.to_path_buf(),
        private_key,
        challenge_difficulty: CHALLENGE_DIFFICULTY,
        challenge_max_solve: Duration::from_millis(500),
        round_interval: ROUND_INTERVAL,
    };

    let shutdown = CancellationToken::new();
    let crypto = Crypto::new(cfg.private_key.clone(), &cfg.hostkeys_path)
        .expect("keyring loads in the simulator sandbox");
    let identity = crypto.identity();
    let challenger = Challenger::new(Duration::from_secs(15), 4, shutdown.clone());
    let store = Arc::new(Mutex::new(MessageStore::new()));

    let api_handle = api::server::start(
        &cfg.api_address,
        Arc::clone(&store),
        identity,
        shutdown.clone(),
    )
    .await
    .expect("API server binds");

    let server = Server::bind(&cfg, crypto, challenger, store, api_handle)
        .await
        .expect("gossip endpoint binds");
    server.spawn_recv_loop(shutdown.clone());

    let mut engine = Gossip::new(&cfg, Arc::clone(&server)).expect("engine starts");
    let samplers = engine.sampler_group();
    let engine_shutdown = shutdown.clone();
    tokio::spawn(async move { engine.run(engine_shutdown).await });

    SimNode {
        identity,
        address,
        server,
        samplers,
        shutdown,
    }
}

fn distinct_peers(node: &SimNode) -> usize {
    node.samplers
        .lock()
        .expect("sampler lock")
        .sample_all()
        .iter()
        .filter(|n| n.identity != node.identity)
        .count()
}

// ── Attack scenario ──

struct AttackReport {
    victim: Identity,
    forged_pushes: usize,
    garbage_datagrams: usize,
}

/// A malicious member of the overlay (its key IS in everyone's keyring)
/// pushes references to a fabricated third-party identity without ever
/// requesting a challenge, and sprays undecryptable garbage.
async fn attack_with_forged_pushes(hostkeys: &Path, nodes: &[SimNode]) -> AttackReport {
    let attacker_key = register_member_key(hostkeys);
    let attacker = Crypto::new(attacker_key, hostkeys).expect("attacker keyring");
    let victim = Identity::from(murmur::sha256(b"fabricated victim identity"));
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("attacker socket");

    let mut forged_pushes = 0;
    let mut garbage_datagrams = 0;
    for node in nodes {
        // a push with a made-up challenge and a third-party node reference
        let body = PacketBody::Push {
            challenge: murmur::sha256(b"not a real challenge"),
            nonce: [0u8; 8],
            node: Node::new(victim, "203.0.113.7:7002"),
        };
        let mut bytes = serialize(&attacker.identity(), &body, attacker.signature_len())
            .expect("push serializes");
        let signature = attacker.sign(&bytes).expect("attacker signs");
        bytes.extend_from_slice(&signature);
        if let Ok(datagram) = attacker.encrypt_packet(&bytes, &node.identity) {
            let _ = socket.send_to(&datagram, node.address.as_str()).await;
            forged_pushes += 1;
        }

        let _ = socket.send_to(&[0xFFu8; 600], node.address.as_str()).await;
        garbage_datagrams += 1;
    }

    AttackReport {
        victim,
        forged_pushes,
        garbage_datagrams,
    }
}

// ── Helpers ──

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("murmur-simulator-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("scratch directory");
    dir
}

fn register_member_key(hostkeys: &Path) -> RsaPrivateKey {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation");
    let public = key.to_public_key();
    let pem = public
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .expect("PEM encoding");
    std::fs::write(hostkeys.join(identity_of(&public).to_string()), pem)
        .expect("hostkey write");
    key
}

fn free_udp_address() -> String {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("ephemeral UDP port");
    socket.local_addr().expect("local addr").to_string()
}

fn free_tcp_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("ephemeral TCP port");
    listener.local_addr().expect("local addr").to_string()
}

async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    predicate()
}

fn print_summary(results: &[ScenarioResult]) {
    println!("\n{}", "========================================".bright_cyan());
    println!("{}", "               SUMMARY".bright_cyan().bold());
    println!("{}", "========================================".bright_cyan());
    for result in results {
        let status = if result.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        println!("  {} {}: {}", status, result.name, result.detail);
    }
    let passed = results.iter().filter(|r| r.passed).count();
    println!("\n  {passed}/{} scenarios passed\n", results.len());
}
