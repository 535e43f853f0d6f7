//! The subscription tree (§4.4, §9): a prefix trie keyed by path segment.
//!
//! Exclusively owned by the router's dispatch task — no locking, per §3's
//! ownership rule. Matching a message path walks root → leaf along the
//! path's segments, unioning the route sets registered at each node visited,
//! which naturally realizes "ancestor-or-equal" prefix matching including the
//! root ("receive-all") subscription.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::message::{Message, Path};
use crate::route::RouteId;

type RouteSender = mpsc::Sender<std::sync::Arc<Message>>;

#[derive(Default)]
struct Node {
    routes: Vec<(RouteId, RouteSender)>,
    children: HashMap<String, Node>,
}

#[derive(Default)]
pub struct SubscriptionTree {
    root: Node,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &Path, id: RouteId, sender: RouteSender) {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.routes.push((id, sender));
    }

    pub fn remove(&mut self, path: &Path, id: RouteId) {
        let mut node = &mut self.root;
        for segment in path.segments() {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.routes.retain(|(route_id, _)| *route_id != id);
    }

    /// Every route whose registered path is an ancestor of or equal to
    /// `message_path`, in root-to-leaf visitation order.
    pub fn matching(&self, message_path: &Path) -> Vec<(RouteId, RouteSender)> {
        let mut matches = Vec::new();
        let mut node = &self.root;
        matches.extend(node.routes.iter().cloned());
        for segment in message_path.segments() {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    matches.extend(node.routes.iter().cloned());
                }
                None => break,
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (RouteSender, mpsc::Receiver<std::sync::Arc<Message>>) {
        mpsc::channel(8)
    }

    #[test]
    fn root_subscription_receives_everything() {
        let mut tree = SubscriptionTree::new();
        let (tx, _rx) = sender();
        tree.insert(&Path::new(""), RouteId(1), tx);
        let matches = tree.matching(&Path::new("/a/b/c"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, RouteId(1));
    }

    #[test]
    fn ancestor_prefix_matches_descendant_message() {
        let mut tree = SubscriptionTree::new();
        let (tx, _rx) = sender();
        tree.insert(&Path::new("/a/b"), RouteId(1), tx);
        assert_eq!(tree.matching(&Path::new("/a/b/c")).len(), 1);
        assert_eq!(tree.matching(&Path::new("/a")).len(), 0);
        assert_eq!(tree.matching(&Path::new("/a/x")).len(), 0);
    }

    #[test]
    fn remove_drops_only_matching_route() {
        let mut tree = SubscriptionTree::new();
        let (tx1, _rx1) = sender();
        let (tx2, _rx2) = sender();
        tree.insert(&Path::new("/a"), RouteId(1), tx1);
        tree.insert(&Path::new("/a"), RouteId(2), tx2);
        tree.remove(&Path::new("/a"), RouteId(1));
        let matches = tree.matching(&Path::new("/a/b"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, RouteId(2));
    }

    #[test]
    fn multiple_ancestors_all_match() {
        let mut tree = SubscriptionTree::new();
        let (tx_root, _r0) = sender();
        let (tx_a, _r1) = sender();
        let (tx_ab, _r2) = sender();
        tree.insert(&Path::new(""), RouteId(0), tx_root);
        tree.insert(&Path::new("/a"), RouteId(1), tx_a);
        tree.insert(&Path::new("/a/b"), RouteId(2), tx_ab);
        let matches = tree.matching(&Path::new("/a/b/c"));
        let ids: Vec<u64> = matches.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
