//! Min-wise independent peer samplers, the history mechanism of Brahms.
//!
//! Each sampler draws a secret random bias and keeps the node whose
//! `SHA-256(bias || identity)` is smallest among everything it has seen.
//! Because the bias is unknown to peers when they emit their streams, the
//! kept node is a uniform sample over the distinct identities observed, and
//! no adversary can craft identities that displace honest entries better
//! than chance.

use rand::seq::SliceRandom;
use rand::RngCore;

use crate::gossip::node::{Identity, Node};
use crate::Hash;

const BIAS_SIZE: usize = 64;

#[derive(Clone, Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("invalid amount of samplers, should be more than 0")]
    InvalidSize,
}

/// One cell of the history mechanism.
pub struct Sampler {
    bias: [u8; BIAS_SIZE],
    slot: Option<Node>,
    min_hash: Hash,
}

impl Sampler {
    fn new() -> Self {
        let mut sampler = Sampler {
            bias: [0u8; BIAS_SIZE],
            slot: None,
            min_hash: [0u8; 32],
        };
        sampler.init();
        sampler
    }

    /// Reseed the bias and clear the slot.
    pub fn init(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.bias);
        self.slot = None;
    }

    /// Offer a node to the sampler; it is kept iff its biased hash is the
    /// smallest seen since the last `init`.
    pub fn next(&mut self, node: &Node) {
        let hash = crate::sha256_concat(&[&self.bias, node.identity.as_bytes()]);
        if self.slot.is_none() || hash < self.min_hash {
            self.slot = Some(node.clone());
            self.min_hash = hash;
        }
    }

    /// The currently held node, if any.
    pub fn sample(&self) -> Option<&Node> {
        self.slot.as_ref()
    }
}

/// A fixed group of independently seeded samplers.
pub struct SamplerGroup {
    samplers: Vec<Sampler>,
}

impl SamplerGroup {
    /// Create `size` independently seeded samplers.
    pub fn new(size: usize) -> Result<Self, SamplerError> {
        if size == 0 {
            return Err(SamplerError::InvalidSize);
        }
        Ok(SamplerGroup {
            samplers: (0..size).map(|_| Sampler::new()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Feed every node to every sampler.
    pub fn update(&mut self, nodes: &[Node]) {
        for node in nodes {
            for sampler in &mut self.samplers {
                sampler.next(node);
            }
        }
    }

    /// All non-empty slots, deduplicated by identity.
    pub fn sample_all(&self) -> Vec<Node> {
        let mut seen = std::collections::HashSet::new();
        let mut samples = Vec::new();
        for node in self.samplers.iter().filter_map(Sampler::sample) {
            if seen.insert(node.identity) {
                samples.push(node.clone());
            }
        }
        samples
    }

    /// A uniform random subset of sampler outputs of size `min(n, non-empty)`.
    pub fn random_subset(&self, n: usize) -> Vec<Node> {
        let mut outputs: Vec<Node> = self
            .samplers
            .iter()
            .filter_map(Sampler::sample)
            .cloned()
            .collect();
        outputs.shuffle(&mut rand::thread_rng());
        outputs.truncate(n);
        outputs
    }

    /// Reseed every sampler currently holding the given identity.
    ///
    /// Used by the liveness pass: peers that stop answering pings are purged
    /// from history so a dead (or Byzantine, now-silent) peer cannot linger.
    pub fn reinit_holding(&mut self, identity: &Identity) {
        for sampler in &mut self.samplers {
            if sampler
                .sample()
                .is_some_and(|node| node.identity == *identity)
            {
                sampler.init();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(seed: u8) -> Node {
        Node::new(
            Identity::from(crate::sha256(&[seed])),
            format!("10.0.0.{seed}:7002"),
        )
    }

    #[test]
    fn sampler_keeps_minimal_biased_hash() {
        let mut sampler = Sampler::new();
        let nodes: Vec<Node> = (0..20).map(make_node).collect();
        for node in &nodes {
            sampler.next(node);
        }

        // with the bias fixed, the winner is exactly the stream minimum
        let expected = nodes
            .iter()
            .min_by_key(|n| crate::sha256_concat(&[&sampler.bias, n.identity.as_bytes()]))
            .unwrap();
        assert_eq!(sampler.sample(), Some(expected));
    }

    #[test]
    fn sampler_is_insensitive_to_stream_order() {
        let mut forward = Sampler::new();
        let mut backward = Sampler::new();
        backward.bias = forward.bias;

        let nodes: Vec<Node> = (0..10).map(make_node).collect();
        for node in &nodes {
            forward.next(node);
        }
        for node in nodes.iter().rev() {
            backward.next(node);
        }
        assert_eq!(forward.sample(), backward.sample());
    }

    #[test]
    fn init_clears_the_slot_and_reseeds() {
        let mut sampler = Sampler::new();
        let bias_before = sampler.bias;
        sampler.next(&make_node(1));
        assert!(sampler.sample().is_some());

        sampler.init();
        assert!(sampler.sample().is_none());
        assert_ne!(sampler.bias, bias_before);
    }

    #[test]
    fn group_requires_positive_size() {
        assert!(matches!(
            SamplerGroup::new(0),
            Err(SamplerError::InvalidSize)
        ));
        assert_eq!(SamplerGroup::new(30).unwrap().len(), 30);
    }

    #[test]
    fn sample_all_deduplicates_by_identity() {
        let mut group = SamplerGroup::new(16).unwrap();
        let nodes: Vec<Node> = (0..2).map(make_node).collect();
        group.update(&nodes);

        let samples = group.sample_all();
        assert!(!samples.is_empty());
        assert!(samples.len() <= 2);
        let identities: std::collections::HashSet<_> =
            samples.iter().map(|n| n.identity).collect();
        assert_eq!(identities.len(), samples.len());
    }

    #[test]
    fn two_nodes_fill_a_large_group_with_both() {
        // with far more samplers than identities, independence makes missing
        // one of two identities across 64 samplers vanishingly unlikely
        let mut group = SamplerGroup::new(64).unwrap();
        let nodes: Vec<Node> = (0..2).map(make_node).collect();
        group.update(&nodes);
        assert_eq!(group.sample_all().len(), 2);
    }

    #[test]
    fn random_subset_is_bounded() {
        let mut group = SamplerGroup::new(8).unwrap();
        assert!(group.random_subset(5).is_empty());

        group.update(&(0..4).map(make_node).collect::<Vec<_>>());
        assert_eq!(group.random_subset(3).len(), 3);
        assert_eq!(group.random_subset(100).len(), 8);
        assert!(group.random_subset(0).is_empty());
    }

    #[test]
    fn reinit_holding_purges_an_identity() {
        let mut group = SamplerGroup::new(16).unwrap();
        let dead = make_node(1);
        group.update(std::slice::from_ref(&dead));
        assert!(!group.sample_all().is_empty());

        group.reinit_holding(&dead.identity);
        assert!(group.sample_all().is_empty());
    }
}
