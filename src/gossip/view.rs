//! The view: a thread-safe, unordered multiset of peers.
//!
//! Used for the main view (next-round push/pull targets) and the per-round
//! push and pull buffers. Appending does not deduplicate; the round engine
//! deduplicates when it rebuilds the main view, which is also where the size
//! bound is enforced.

use std::sync::Mutex;

use crate::gossip::node::Node;

#[derive(Default)]
pub struct View {
    nodes: Mutex<Vec<Node>>,
}

impl View {
    pub fn new() -> Self {
        View::default()
    }

    /// Append a node, even if an equal node is already present.
    pub fn append(&self, node: Node) {
        self.nodes.lock().expect("view lock poisoned").push(node);
    }

    /// Drop all nodes.
    pub fn clear(&self) {
        self.nodes.lock().expect("view lock poisoned").clear();
    }

    /// Snapshot copy of the current contents.
    pub fn get_all(&self) -> Vec<Node> {
        self.nodes.lock().expect("view lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("view lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
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
    fn append_then_get_all_contains_the_node() {
        let view = View::new();
        let node = make_node(1);
        view.append(node.clone());
        assert_eq!(view.get_all(), vec![node]);
    }

    #[test]
    fn append_is_a_multiset() {
        let view = View::new();
        view.append(make_node(1));
        view.append(make_node(1));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn clear_then_get_all_is_empty() {
        let view = View::new();
        view.append(make_node(1));
        view.append(make_node(2));
        view.clear();
        assert!(view.get_all().is_empty());
        assert!(view.is_empty());
    }

    #[test]
    fn get_all_is_a_snapshot() {
        let view = View::new();
        view.append(make_node(1));
        let snapshot = view.get_all();
        view.clear();
        assert_eq!(snapshot.len(), 1);
    }
}
