//! The Brahms round engine.
//!
//! Each round pushes our identity to a random α·L-subset of the view, pulls
//! views from a β·L-subset, then rebuilds the view from bounded shares of
//! push responses, pull responses, and sampler history. The push share is
//! bounded and the rebuild is skipped entirely when pushes exceed it, so an
//! adversary flooding pushes cannot take over the view: its lasting influence
//! is limited to what survives the min-wise samplers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::config::GossipConfig;
use crate::constants::PONG_TIMEOUT;
use crate::gossip::node::Node;
use crate::gossip::sampler::{SamplerError, SamplerGroup};
use crate::gossip::server::Server;

/// The round driver. Owns the main view and the sampler history; everything
/// the packet handlers touch lives in the [`Server`].
pub struct Gossip {
    server: Arc<Server>,
    sampler_group: Arc<Mutex<SamplerGroup>>,
    main_view: Vec<Node>,
    alpha: f64,
    beta: f64,
    gamma: f64,
    view_size: usize,
    rounds_between_pings: u64,
    round_interval: Duration,
    round: u64,
}

impl Gossip {
    /// Create the engine, seeding view and samplers from the bootstrap
    /// nodes.
    pub fn new(cfg: &GossipConfig, server: Arc<Server>) -> Result<Self, SamplerError> {
        let mut sampler_group = SamplerGroup::new(cfg.sampler_size)?;
        sampler_group.update(&cfg.bootstrap_nodes);
        Ok(Gossip {
            server,
            sampler_group: Arc::new(Mutex::new(sampler_group)),
            main_view: cfg.bootstrap_nodes.clone(),
            alpha: cfg.alpha,
            beta: cfg.beta,
            gamma: cfg.gamma,
            view_size: cfg.view_size,
            rounds_between_pings: cfg.rounds_between_pings,
            round_interval: cfg.round_interval,
            round: 0,
        })
    }

    /// Shared handle to the sampler history, e.g. for health inspection.
    pub fn sampler_group(&self) -> Arc<Mutex<SamplerGroup>> {
        Arc::clone(&self.sampler_group)
    }

    /// Drive rounds until shutdown. This is the node's cancellation root.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(
            view = self.main_view.len(),
            samplers = self.sampler_group.lock().expect("sampler lock poisoned").len(),
            "Gossip rounds starting"
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let pulls_sent = self.begin_round().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.round_interval) => {}
            }
            self.finish_round(pulls_sent);
        }
        tracing::info!(round = self.round, "Gossip rounds stopped");
    }

    /// Round prologue: reset per-round state, publish the view snapshot, run
    /// the liveness pass when due, and emit push/pull requests.
    ///
    /// Returns the number of pull requests sent.
    async fn begin_round(&mut self) -> usize {
        self.server.reset_round();
        self.server.push_view().clear();
        self.server.pull_view().clear();
        self.server.set_pull_response_nodes(self.main_view.clone());

        if self.rounds_between_pings > 0
            && self.round > 0
            && self.round % self.rounds_between_pings == 0
        {
            self.ping_samples().await;
        }

        for node in random_subset(&self.main_view, self.alpha_count()) {
            self.server.request_push(&node).await;
        }
        let pull_targets = random_subset(&self.main_view, self.beta_count());
        for node in &pull_targets {
            self.server.request_pull(node).await;
        }
        pull_targets.len()
    }

    /// Round epilogue: aggregate the round's responses into the next view,
    /// feed the samplers, and age the message store.
    fn finish_round(&mut self, pulls_sent: usize) {
        let pushes = self.server.push_view().get_all();
        let pulls = self.server.pull_view().get_all();

        // an empty push set means we are isolated this round; more pushes
        // than we asked for means someone is flooding. either way, keep the
        // old view
        if !pushes.is_empty()
            && pushes.len() <= self.alpha_count()
            && (!pulls.is_empty() || pulls_sent == 0)
        {
            let mut merged = random_subset(&pushes, self.alpha_count());
            merged.extend(random_subset(&pulls, self.beta_count()));
            merged.extend(
                self.sampler_group
                    .lock()
                    .expect("sampler lock poisoned")
                    .random_subset(self.gamma_count()),
            );
            self.main_view = trim_duplicates(merged);
            tracing::debug!(
                round = self.round,
                view = self.main_view.len(),
                pushes = pushes.len(),
                pulls = pulls.len(),
                "View rebuilt"
            );
        } else {
            tracing::debug!(
                round = self.round,
                pushes = pushes.len(),
                pulls = pulls.len(),
                "View kept"
            );
        }

        let mut observed = pushes;
        observed.extend(pulls);
        self.sampler_group
            .lock()
            .expect("sampler lock poisoned")
            .update(&observed);

        self.server
            .store()
            .lock()
            .expect("message store lock poisoned")
            .decay();
        self.round += 1;
    }

    /// Ping every distinct sampled peer concurrently and reseed the samplers
    /// of those that stay silent.
    async fn ping_samples(&mut self) {
        let samples = self
            .sampler_group
            .lock()
            .expect("sampler lock poisoned")
            .sample_all();
        if samples.is_empty() {
            return;
        }
        tracing::debug!(round = self.round, peers = samples.len(), "Liveness ping pass");

        let mut join_set = tokio::task::JoinSet::new();
        for node in samples {
            let server = Arc::clone(&self.server);
            join_set.spawn(async move {
                let alive = server.ping_and_wait(&node, PONG_TIMEOUT).await;
                (node, alive)
            });
        }
        while let Some(result) = join_set.join_next().await {
            if let Ok((node, false)) = result {
                tracing::info!(peer = %node, "Sampled peer unresponsive, reseeding its samplers");
                self.sampler_group
                    .lock()
                    .expect("sampler lock poisoned")
                    .reinit_holding(&node.identity);
            }
        }
    }

    fn alpha_count(&self) -> usize {
        (self.alpha * self.view_size as f64).round() as usize
    }

    fn beta_count(&self) -> usize {
        (self.beta * self.view_size as f64).round() as usize
    }

    fn gamma_count(&self) -> usize {
        (self.gamma * self.view_size as f64).round() as usize
    }
}

/// A uniform random subset of size `min(n, |nodes|)`.
fn random_subset(nodes: &[Node], n: usize) -> Vec<Node> {
    let mut subset = nodes.to_vec();
    subset.shuffle(&mut rand::thread_rng());
    subset.truncate(n);
    subset
}

/// Deduplicate by (identity, address), keeping first occurrences.
fn trim_duplicates(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for node in nodes {
        if seen.insert(node.clone()) {
            unique.push(node);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::node::Identity;

    fn make_node(seed: u8) -> Node {
        Node::new(
            Identity::from(crate::sha256(&[seed])),
            format!("10.0.0.{seed}:7002"),
        )
    }

    #[test]
    fn random_subset_of_empty_slice_is_empty() {
        assert!(random_subset(&[], 0).is_empty());
        assert!(random_subset(&[], 5).is_empty());
    }

    #[test]
    fn random_subset_returns_requested_size() {
        let nodes: Vec<Node> = (0..10).map(make_node).collect();
        assert_eq!(random_subset(&nodes, 5).len(), 5);
        assert_eq!(random_subset(&nodes, 0).len(), 0);
    }

    #[test]
    fn random_subset_caps_at_available_nodes() {
        let nodes: Vec<Node> = (0..10).map(make_node).collect();
        assert_eq!(random_subset(&nodes, 40).len(), 10);
    }

    #[test]
    fn random_subset_of_one_is_that_node() {
        let nodes = vec![make_node(1)];
        assert_eq!(random_subset(&nodes, 1), nodes);
    }

    #[test]
    fn random_subset_draws_without_replacement() {
        let nodes: Vec<Node> = (0..10).map(make_node).collect();
        let subset = random_subset(&nodes, 10);
        let identities: HashSet<_> = subset.iter().map(|n| n.identity).collect();
        assert_eq!(identities.len(), 10);
    }

    #[test]
    fn trim_duplicates_starts_empty_and_keeps_distinct_addresses() {
        let a = make_node(1);
        let b = make_node(2);
        let rehomed = Node::new(a.identity, "10.9.9.9:7002");
        let trimmed = trim_duplicates(vec![
            a.clone(),
            b.clone(),
            a.clone(),
            rehomed.clone(),
            b.clone(),
        ]);
        assert_eq!(trimmed, vec![a, b, rehomed]);
    }
}
