//! The topology graph learned from the mesh.
//!
//! Nodes, their subnet claims and the directed edge set are an
//! eventually-consistent replicated set: ADD of a present element and
//! DEL of an absent one are no-ops, and edge weight is last-writer-wins.
//! Whenever the edge set changes, nexthop pointers are recomputed by
//! BFS from the local node over adjacent connections, with ties broken
//! by ascending peer name.
//!
//! Storage is by-name in ordered maps; nexthop and edge endpoints are
//! names validated against the maps on use, never owning references.
//! Dumps and BFS both rely on the lexicographic iteration order.

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;

/// Per-node cumulative traffic counters, both sides of the plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub tap_in_packets: u64,
    pub tap_in_bytes: u64,
    pub tap_out_packets: u64,
    pub tap_out_bytes: u64,
    pub socket_in_packets: u64,
    pub socket_in_bytes: u64,
    pub socket_out_packets: u64,
    pub socket_out_bytes: u64,
}

/// A reachable VPN participant (not necessarily adjacent).
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Public-key fingerprint, empty until learned.
    pub fingerprint: String,
    /// Subnets this node claims, ordered.
    pub subnets: Vec<IpNet>,
    /// Advertised data-plane address.
    pub address: Option<IpAddr>,
    pub port: u16,
    /// Name of the adjacent connection packets for this node leave on.
    /// `None` means unreachable. Never set for the local node.
    pub nexthop: Option<String>,
    /// Whether we hold a current packet key for this node. Cleared by
    /// KEY_CHANGED, set again by ANS_KEY.
    pub valid_key: bool,
    pub counters: TrafficCounters,
}

impl Node {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fingerprint: String::new(),
            subnets: Vec::new(),
            address: None,
            port: 0,
            nexthop: None,
            valid_key: false,
            counters: TrafficCounters::default(),
        }
    }
}

/// Directed meta-adjacency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeInfo {
    pub weight: u32,
    pub options: u32,
}

/// The learned topology, rooted at the local node.
#[derive(Debug)]
pub struct Topology {
    self_name: String,
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<(String, String), EdgeInfo>,
}

impl Topology {
    /// Create a topology containing only the local node.
    pub fn new(self_name: &str, fingerprint: &str) -> Self {
        let mut nodes = BTreeMap::new();
        let mut me = Node::new(self_name);
        me.fingerprint = fingerprint.to_string();
        nodes.insert(self_name.to_string(), me);
        Self {
            self_name: self_name.to_string(),
            nodes,
            edges: BTreeMap::new(),
        }
    }

    /// The local node's name.
    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Look up a node.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Mutable access to a node's counters, creating nothing.
    pub fn counters_mut(&mut self, name: &str) -> Option<&mut TrafficCounters> {
        self.nodes.get_mut(name).map(|n| &mut n.counters)
    }

    /// All nodes in lexicographic order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All edges in lexicographic order.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &EdgeInfo)> {
        self.edges
            .iter()
            .map(|((from, to), info)| (from.as_str(), to.as_str(), info))
    }

    /// All subnet claims, ordered by owner then prefix.
    pub fn subnets(&self) -> impl Iterator<Item = (&str, &IpNet)> {
        self.nodes
            .values()
            .flat_map(|n| n.subnets.iter().map(move |s| (n.name.as_str(), s)))
    }

    /// Number of known nodes, local included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Record a node. Returns false when the node was already known with
    /// the same attributes.
    pub fn add_node(
        &mut self,
        name: &str,
        fingerprint: &str,
        address: Option<IpAddr>,
        port: u16,
    ) -> bool {
        let node = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| Node::new(name));
        let changed = node.fingerprint != fingerprint
            || node.address != address
            || node.port != port;
        node.fingerprint = fingerprint.to_string();
        node.address = address;
        node.port = port;
        changed
    }

    /// Remove a node together with its subnets and every edge touching
    /// it, so nothing is left orphaned. The local node cannot be
    /// removed. Returns false when the node was unknown.
    pub fn del_node(&mut self, name: &str) -> bool {
        if name == self.self_name || self.nodes.remove(name).is_none() {
            return false;
        }
        self.edges
            .retain(|(from, to), _| from != name && to != name);
        true
    }

    /// Claim a subnet for `owner`.
    ///
    /// Fails with [`Error::Duplicate`] when the prefix overlaps a claim
    /// held by a different node; the caller disconnects the later
    /// claimant. Returns false for a repeat of an existing claim.
    pub fn add_subnet(&mut self, owner: &str, subnet: IpNet) -> Result<bool> {
        for (holder, claimed) in self.subnets() {
            if holder != owner && overlaps(claimed, &subnet) {
                return Err(Error::Duplicate(format!(
                    "subnet {subnet} claimed by {owner} overlaps {claimed} owned by {holder}"
                )));
            }
        }

        let node = self
            .nodes
            .entry(owner.to_string())
            .or_insert_with(|| Node::new(owner));
        if node.subnets.contains(&subnet) {
            return Ok(false);
        }
        node.subnets.push(subnet);
        node.subnets.sort();
        Ok(true)
    }

    /// Drop a subnet claim. Returns false when the claim was absent.
    pub fn del_subnet(&mut self, owner: &str, subnet: &IpNet) -> bool {
        let Some(node) = self.nodes.get_mut(owner) else {
            return false;
        };
        let before = node.subnets.len();
        node.subnets.retain(|s| s != subnet);
        node.subnets.len() != before
    }

    /// The node owning the most specific subnet containing `addr`.
    pub fn route(&self, addr: &IpAddr) -> Option<&Node> {
        self.nodes
            .values()
            .flat_map(|n| n.subnets.iter().map(move |s| (n, s)))
            .filter(|(_, s)| s.contains(addr))
            .max_by_key(|(_, s)| s.prefix_len())
            .map(|(n, _)| n)
    }

    /// Record a directed edge; weight and options are last-writer-wins.
    /// Unknown endpoints get skeleton nodes so the edge is never
    /// dangling. Returns false when nothing changed.
    pub fn add_edge(&mut self, from: &str, to: &str, weight: u32, options: u32) -> bool {
        if from == to {
            return false;
        }
        for endpoint in [from, to] {
            self.nodes
                .entry(endpoint.to_string())
                .or_insert_with(|| Node::new(endpoint));
        }
        let info = EdgeInfo { weight, options };
        match self.edges.insert((from.to_string(), to.to_string()), info) {
            Some(old) => old != info,
            None => true,
        }
    }

    /// Remove a directed edge. Returns false when it was absent.
    pub fn del_edge(&mut self, from: &str, to: &str) -> bool {
        self.edges
            .remove(&(from.to_string(), to.to_string()))
            .is_some()
    }

    /// Whether the directed edge exists.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges
            .contains_key(&(from.to_string(), to.to_string()))
    }

    /// Recompute every node's nexthop by BFS from the local node.
    ///
    /// `is_adjacent` reports whether a first-hop name is backed by an
    /// active, authenticated connection. Edges are walked in either
    /// direction since adjacencies are announced from both sides and
    /// one announcement may arrive first. Neighbor expansion is in
    /// ascending name order, so equal-distance ties resolve to the
    /// lexicographically smallest first hop.
    pub fn recompute_nexthops(&mut self, is_adjacent: impl Fn(&str) -> bool) {
        let mut neighbors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (from, to) in self.edges.keys() {
            neighbors.entry(from).or_default().push(to);
            neighbors.entry(to).or_default().push(from);
        }
        for list in neighbors.values_mut() {
            list.sort_unstable();
            list.dedup();
        }

        // nexthop of each reachable node, rooted at the adjacent
        // connections themselves.
        let mut nexthop: BTreeMap<String, String> = BTreeMap::new();
        let mut queue = VecDeque::new();

        if let Some(first_hops) = neighbors.get(self.self_name.as_str()) {
            for &hop in first_hops {
                if is_adjacent(hop) {
                    nexthop.insert(hop.to_string(), hop.to_string());
                    queue.push_back(hop.to_string());
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            let via = nexthop
                .get(&current)
                .cloned()
                .expect("queued nodes have a nexthop");
            if let Some(nexts) = neighbors.get(current.as_str()) {
                for &next in nexts {
                    if next == self.self_name || nexthop.contains_key(next) {
                        continue;
                    }
                    nexthop.insert(next.to_string(), via.clone());
                    queue.push_back(next.to_string());
                }
            }
        }

        for node in self.nodes.values_mut() {
            if node.name == self.self_name {
                node.nexthop = None;
            } else {
                node.nexthop = nexthop.get(&node.name).cloned();
            }
        }
    }

    /// Mark that we hold a current packet key for `name`.
    pub fn validate_key(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.valid_key = true;
        }
    }

    /// Forget the packet key held for `name`. Returns true on the
    /// valid-to-invalid transition (first receipt of a KEY_CHANGED).
    pub fn invalidate_key(&mut self, name: &str) -> bool {
        match self.nodes.get_mut(name) {
            Some(node) if node.valid_key => {
                node.valid_key = false;
                true
            }
            _ => false,
        }
    }

    /// Drop every unreachable node (nexthop unset) together with its
    /// subnets and edges. Returns the removed names.
    pub fn purge(&mut self) -> Vec<String> {
        let doomed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.name != self.self_name && n.nexthop.is_none())
            .map(|n| n.name.clone())
            .collect();
        for name in &doomed {
            self.del_node(name);
        }
        doomed
    }
}

/// Whether two prefixes overlap (share any address).
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}
