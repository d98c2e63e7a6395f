//! The meta-protocol engine.
//!
//! [`Mesh`] is the protocol-visible state of the daemon: configuration,
//! identity, the connection registry and the topology graph. The engine
//! dispatches one received line at a time, drives the authentication
//! handshake, applies topology updates and fans rebroadcastable
//! requests out to the rest of the mesh.
//!
//! Rebroadcast happens only when a request changed local state: since
//! updates are idempotent, a no-op receipt has already been seen via
//! another path and forwarding it again would circulate forever in a
//! cyclic mesh. Origin suppression alone bounds a tree, change
//! suppression bounds the general graph.

use crate::config::{valid_name, Config};
use crate::connection::{ConnId, ConnState, Connection};
use crate::crypto;
use crate::error::{Error, Result};
use crate::keys::{self, Keypair};
use crate::protocol::{parse_line, Request, MAX_LINE, PROTOCOL_VERSION};
use crate::registry::Registry;
use crate::topology::Topology;
use base64::Engine;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Length of the data-plane packet key.
const PACKET_KEY_LEN: usize = 32;

/// Window during which a repeated KEY_CHANGED for the same node is not
/// forwarded again. Bounds the flood in a cyclic mesh without blocking
/// propagation.
const KEY_CHANGED_GUARD: Duration = Duration::from_secs(1);

/// Wire token for an unknown advertised address.
const NO_ADDRESS: &str = "-";

/// Why a connection is being torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly teardown (TERMREQ, peer ERROR notice).
    Graceful(String),
    /// The connection faulted.
    Faulted(Error),
}

/// Side effects a dispatch produced that reach beyond the mesh state.
#[derive(Debug)]
pub enum Effect {
    /// Tear down a connection (usually the one that faulted).
    Close { id: ConnId, reason: CloseReason },
    /// Hand a freshly learned packet key to the data plane.
    InstallPacketKey { node: String, key: Vec<u8> },
}

/// Protocol-visible daemon state: registry, topology, identity.
pub struct Mesh {
    pub config: Config,
    keypair: Keypair,
    pub registry: Registry,
    pub topology: Topology,
    /// Our data-plane packet key, answered to REQ_KEY.
    packet_key: Vec<u8>,
    /// Last forward time of KEY_CHANGED per node.
    key_changed_guard: BTreeMap<String, Instant>,
}

impl Mesh {
    /// Build the mesh state around a parsed configuration and identity,
    /// claiming our own subnets. Overlapping local claims are a
    /// configuration error.
    pub fn new(config: Config, keypair: Keypair) -> Result<Self> {
        let fingerprint = keypair.fingerprint();
        let mut topology = Topology::new(&config.name, &fingerprint);
        topology.add_node(&config.name, &fingerprint, None, config.port);
        for subnet in &config.subnets {
            topology
                .add_subnet(&config.name, *subnet)
                .map_err(|e| Error::Config(format!("local subnet claim: {e}")))?;
        }
        Ok(Self {
            config,
            keypair,
            registry: Registry::new(),
            topology,
            packet_key: new_packet_key(),
            key_changed_guard: BTreeMap::new(),
        })
    }

    /// Our node name.
    pub fn self_name(&self) -> &str {
        self.topology.self_name()
    }

    /// Register an outgoing connection whose socket just opened, and
    /// send our ID. `target` is the configured peer the dial was for;
    /// the peer must identify as that node.
    pub fn add_outgoing(
        &mut self,
        addr: SocketAddr,
        target: &str,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<ConnId> {
        crate::checkpoint!();
        let id = self.registry.next_id();
        let mut conn = Connection::new(id, addr, true, outbound);
        conn.expected_name = Some(target.to_string());
        self.send_id(&conn)?;
        conn.advance(ConnState::IdSent)?;
        self.registry.insert(conn);
        Ok(id)
    }

    /// Register an accepted incoming connection; we wait for the peer's
    /// ID before saying anything.
    pub fn add_incoming(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<String>,
    ) -> ConnId {
        crate::checkpoint!();
        let id = self.registry.next_id();
        let conn = Connection::new(id, addr, false, outbound);
        self.registry.insert(conn);
        id
    }

    /// Dispatch one received line. `Err` means this connection faulted
    /// and must be closed with the returned error.
    pub fn handle_line(&mut self, id: ConnId, line: &str) -> Result<Vec<Effect>> {
        crate::checkpoint!();
        let parsed = parse_line(line)?;
        let request = parsed.request;

        let conn = self
            .registry
            .get_mut(id)
            .ok_or_else(|| Error::Protocol(format!("line for unknown connection {id}")))?;
        conn.touch();

        if !request.is_handshake() && !conn.active() {
            // TERMREQ and ERROR may arrive while the peer is shutting
            // down mid-handshake; everything else must wait for ACK.
            if !matches!(request, Request::TermReq | Request::Error) {
                return Err(Error::Protocol(format!(
                    "{} received before connection is active",
                    request.name()
                )));
            }
        }

        match request {
            Request::Id => self.handle_id(id, &parsed.args),
            Request::MetaKey => self.handle_metakey(id, &parsed.args),
            Request::Challenge => self.handle_challenge(id, &parsed.args),
            Request::ChalReply => self.handle_chal_reply(id, &parsed.args),
            Request::Ack => self.handle_ack(id),
            Request::Status => {
                let conn = self.registry.get(id).expect("connection exists");
                log::info!("Status from {}: {}", conn.label(), parsed.args.join(" "));
                Ok(Vec::new())
            }
            Request::Error => {
                let conn = self.registry.get(id).expect("connection exists");
                log::warn!("Error from {}: {}", conn.label(), parsed.args.join(" "));
                Ok(vec![Effect::Close {
                    id,
                    reason: CloseReason::Graceful("peer reported an error".to_string()),
                }])
            }
            Request::TermReq => Ok(vec![Effect::Close {
                id,
                reason: CloseReason::Graceful("termination requested".to_string()),
            }]),
            Request::Ping => {
                let conn = self.registry.get(id).expect("connection exists");
                conn.send(Request::Pong, &[])?;
                Ok(Vec::new())
            }
            Request::Pong => Ok(Vec::new()),
            Request::AddNode => self.handle_add_node(id, line, &parsed.args),
            Request::DelNode => self.handle_del_node(id, line, &parsed.args),
            Request::AddSubnet => self.handle_add_subnet(id, line, &parsed.args),
            Request::DelSubnet => self.handle_del_subnet(id, line, &parsed.args),
            Request::AddEdge => self.handle_add_edge(id, line, &parsed.args),
            Request::DelEdge => self.handle_del_edge(id, line, &parsed.args),
            Request::KeyChanged => self.handle_key_changed(id, line, &parsed.args),
            Request::ReqKey => self.handle_req_key(&parsed.args),
            Request::AnsKey => self.handle_ans_key(&parsed.args),
            Request::Control => Err(Error::Protocol(
                "control request on a meta-connection".to_string(),
            )),
        }
    }

    fn send_id(&self, conn: &Connection) -> Result<()> {
        conn.send(
            Request::Id,
            &[
                &self.config.name,
                &PROTOCOL_VERSION.to_string(),
                &0u32.to_string(),
            ],
        )
    }

    fn handle_id(&mut self, id: ConnId, args: &[&str]) -> Result<Vec<Effect>> {
        let name = args[0];
        let version: u32 = args[1]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad version '{}'", args[1])))?;
        let options: u32 = args[2]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad options '{}'", args[2])))?;

        if !valid_name(name) {
            return Err(Error::Protocol(format!("invalid peer name '{name}'")));
        }
        if version > PROTOCOL_VERSION {
            return Err(Error::IncompatibleVersion {
                peer: version,
                ours: PROTOCOL_VERSION,
            });
        }
        let peer_config = self
            .config
            .peer(name)
            .ok_or_else(|| Error::Auth(format!("unknown peer '{name}'")))?;
        let peer_public = keys::parse_public_key(&peer_config.public_key)?;

        let state = {
            let conn = self.registry.get(id).expect("connection exists");
            if !matches!(conn.state, ConnState::AwaitId | ConnState::IdSent) {
                return Err(Error::Protocol("unexpected ID".to_string()));
            }
            if let Some(expected) = &conn.expected_name {
                if expected != name {
                    return Err(Error::Auth(format!(
                        "dialed {expected} but peer identifies as {name}"
                    )));
                }
            }
            conn.state
        };

        self.registry.bind_name(id, name)?;

        // The acceptor has not introduced itself yet.
        if state == ConnState::AwaitId {
            let conn = self.registry.get(id).expect("connection exists");
            self.send_id(conn)?;
        }

        let conn = self.registry.get_mut(id).expect("connection exists");
        conn.version = version;
        conn.options = options;

        let sealed = crypto::seal_session_key(&peer_public, conn.local_key())?;
        let ephemeral = base64_encode(&sealed.ephemeral);
        let ciphertext = base64_encode(&sealed.ciphertext);
        conn.send(Request::MetaKey, &[&ephemeral, &ciphertext])?;
        conn.advance(ConnState::AwaitMetaKey)?;
        Ok(Vec::new())
    }

    fn handle_metakey(&mut self, id: ConnId, args: &[&str]) -> Result<Vec<Effect>> {
        let ephemeral: [u8; 32] = base64_decode(args[0])?
            .try_into()
            .map_err(|_| Error::Protocol("bad ephemeral key length".to_string()))?;
        let ciphertext = base64_decode(args[1])?;

        let conn = self.registry.get_mut(id).expect("connection exists");
        if conn.state != ConnState::AwaitMetaKey {
            return Err(Error::Protocol("unexpected METAKEY".to_string()));
        }

        let peer_key =
            crypto::open_session_key(self.keypair.private_key(), &ephemeral, &ciphertext)?;
        conn.set_peer_key(&peer_key);

        let nonce = crypto::generate_challenge();
        let blob = conn
            .peer_cipher()
            .expect("peer key just installed")
            .encrypt(&nonce)?;
        conn.sent_challenge = Some(nonce);
        conn.send(Request::Challenge, &[&base64_encode(&blob)])?;
        conn.advance(ConnState::AwaitChallenge)?;
        Ok(Vec::new())
    }

    fn handle_challenge(&mut self, id: ConnId, args: &[&str]) -> Result<Vec<Effect>> {
        let blob = base64_decode(args[0])?;

        let conn = self.registry.get_mut(id).expect("connection exists");
        if conn.state != ConnState::AwaitChallenge {
            return Err(Error::Protocol("unexpected CHALLENGE".to_string()));
        }

        // The peer encrypted its nonce under our session key.
        let nonce = conn.local_cipher().decrypt(&blob)?;
        let digest = crypto::challenge_digest(&nonce);
        conn.send(Request::ChalReply, &[&base64_encode(&digest)])?;
        conn.advance(ConnState::AwaitChalReply)?;
        Ok(Vec::new())
    }

    fn handle_chal_reply(&mut self, id: ConnId, args: &[&str]) -> Result<Vec<Effect>> {
        let digest = base64_decode(args[0])?;

        let (name, weight) = {
            let conn = self.registry.get_mut(id).expect("connection exists");
            if conn.state != ConnState::AwaitChalReply {
                return Err(Error::Protocol("unexpected CHAL_REPLY".to_string()));
            }
            let nonce = conn
                .sent_challenge
                .take()
                .ok_or_else(|| Error::Protocol("no challenge outstanding".to_string()))?;
            if digest != crypto::challenge_digest(&nonce) {
                return Err(Error::Auth(format!(
                    "challenge digest mismatch from {}",
                    conn.label()
                )));
            }

            conn.send(Request::Ack, &[])?;
            conn.advance(ConnState::Authenticated)?;
            let name = conn.name.clone().expect("authenticated peers have names");
            let weight = self.config.peer(&name).map(|p| p.weight).unwrap_or(1);
            (name, weight)
        };

        log::info!("Connection with {name} authenticated");
        self.attach_peer(id, &name, weight)?;
        Ok(Vec::new())
    }

    /// Record the authenticated peer in the topology, announce the new
    /// adjacency, and send the peer our view of the net.
    fn attach_peer(&mut self, id: ConnId, name: &str, weight: u32) -> Result<()> {
        let self_name = self.topology.self_name().to_string();

        // Everything we know about the peer from the configuration.
        if let Some(peer_config) = self.config.peer(name) {
            let fingerprint = keys::parse_public_key(&peer_config.public_key)
                .map(|k| keys::fingerprint(&k))
                .unwrap_or_default();
            self.topology
                .add_node(name, &fingerprint, peer_config.address, peer_config.port);
        }

        self.topology.add_edge(&self_name, name, weight, 0);
        let is_adjacent = adjacency(&self.registry);
        self.topology.recompute_nexthops(is_adjacent);

        // Announce the adjacency to the rest of the mesh.
        self.registry.broadcast_except(
            Some(id),
            Request::AddEdge,
            &[&self_name, name, &weight.to_string(), "0"],
        );
        if let Some(node) = self.topology.node(name) {
            let address = format_address(node.address);
            let port = node.port.to_string();
            self.registry.broadcast_except(
                Some(id),
                Request::AddNode,
                &[name, &node.fingerprint, &address, &port],
            );
        }

        // And give the new peer our full view.
        self.dump_topology_to(id)?;
        Ok(())
    }

    fn handle_ack(&mut self, id: ConnId) -> Result<Vec<Effect>> {
        let name = {
            let conn = self.registry.get_mut(id).expect("connection exists");
            if conn.state != ConnState::Authenticated {
                return Err(Error::Protocol("unexpected ACK".to_string()));
            }
            conn.advance(ConnState::Active)?;
            log::info!("Connection with {} active", conn.label());
            conn.name.clone()
        };

        // Fetch the peer's packet key for the data plane right away.
        if let Some(name) = name {
            if let Err(e) = self.request_key(&name) {
                log::debug!("Cannot request key from {name}: {e}");
            }
        }
        Ok(Vec::new())
    }

    /// Send our whole topology view down one connection.
    fn dump_topology_to(&self, id: ConnId) -> Result<()> {
        let conn = self
            .registry
            .get(id)
            .ok_or_else(|| Error::Protocol(format!("no connection {id}")))?;

        for node in self.topology.nodes() {
            let address = format_address(node.address);
            conn.send(
                Request::AddNode,
                &[
                    &node.name,
                    &node.fingerprint,
                    &address,
                    &node.port.to_string(),
                ],
            )?;
        }
        for (owner, subnet) in self.topology.subnets() {
            conn.send(Request::AddSubnet, &[owner, &subnet.to_string()])?;
        }
        for (from, to, info) in self.topology.edges() {
            conn.send(
                Request::AddEdge,
                &[from, to, &info.weight.to_string(), &info.options.to_string()],
            )?;
        }
        Ok(())
    }

    fn handle_add_node(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let (name, fingerprint) = (args[0], args[1]);
        if !valid_name(name) {
            return Err(Error::Protocol(format!("invalid node name '{name}'")));
        }
        if name == self.topology.self_name() {
            return Ok(Vec::new());
        }
        let address = parse_address(args[2])?;
        let port: u16 = args[3]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad port '{}'", args[3])))?;

        if self.topology.add_node(name, fingerprint, address, port) {
            self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
        }
        Ok(Vec::new())
    }

    fn handle_del_node(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let name = args[0];
        if name == self.topology.self_name() {
            return Ok(Vec::new());
        }
        if self.topology.del_node(name) {
            let is_adjacent = adjacency(&self.registry);
            self.topology.recompute_nexthops(is_adjacent);
            self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
        } else {
            log::debug!("DEL_NODE for unknown node {name}");
        }
        Ok(Vec::new())
    }

    fn handle_add_subnet(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let owner = args[0];
        let subnet = parse_subnet(args[1])?;

        match self.topology.add_subnet(owner, subnet) {
            Ok(true) => {
                self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
                Ok(Vec::new())
            }
            Ok(false) => Ok(Vec::new()),
            // Conflicting claim: the connection that delivered the later
            // claimant is disconnected.
            Err(e) => Err(e),
        }
    }

    fn handle_del_subnet(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let owner = args[0];
        let subnet = parse_subnet(args[1])?;

        if self.topology.del_subnet(owner, &subnet) {
            self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
        } else {
            log::debug!("DEL_SUBNET {subnet} for {owner}: no such claim");
        }
        Ok(Vec::new())
    }

    fn handle_add_edge(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let (from, to) = (args[0], args[1]);
        let weight: u32 = args[2]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad weight '{}'", args[2])))?;
        let options: u32 = args[3]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad options '{}'", args[3])))?;
        if !valid_name(from) || !valid_name(to) {
            return Err(Error::Protocol("invalid edge endpoint".to_string()));
        }

        if self.topology.add_edge(from, to, weight, options) {
            let is_adjacent = adjacency(&self.registry);
            self.topology.recompute_nexthops(is_adjacent);
            self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
        }
        Ok(Vec::new())
    }

    fn handle_del_edge(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let (from, to) = (args[0], args[1]);

        if self.topology.del_edge(from, to) {
            let is_adjacent = adjacency(&self.registry);
            self.topology.recompute_nexthops(is_adjacent);
            self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
        } else {
            log::debug!("DEL_EDGE {from}->{to}: no such edge");
        }
        Ok(Vec::new())
    }

    fn handle_key_changed(&mut self, id: ConnId, line: &str, args: &[&str]) -> Result<Vec<Effect>> {
        let name = args[0];
        if name == self.topology.self_name() {
            return Ok(Vec::new());
        }
        self.topology.invalidate_key(name);

        let now = Instant::now();
        let forward = self
            .key_changed_guard
            .get(name)
            .is_none_or(|last| now.duration_since(*last) >= KEY_CHANGED_GUARD);
        if forward {
            self.key_changed_guard.insert(name.to_string(), now);
            self.registry.broadcast_line_except(Some(id), line_nl(line).as_str());
        }
        Ok(Vec::new())
    }

    fn handle_req_key(&mut self, args: &[&str]) -> Result<Vec<Effect>> {
        let (from, to) = (args[0], args[1]);

        // Routing failures drop the request; they are not the fault of
        // the connection that delivered it.
        let result = if to == self.topology.self_name() {
            let encoded = base64_encode(&self.packet_key);
            self.send_to_node(from, Request::AnsKey, &[to, from, &encoded])
        } else {
            self.send_to_node(to, Request::ReqKey, &[from, to])
        };
        if let Err(e) = result {
            log::debug!("Dropping REQ_KEY {from}->{to}: {e}");
        }
        Ok(Vec::new())
    }

    fn handle_ans_key(&mut self, args: &[&str]) -> Result<Vec<Effect>> {
        let (from, to, key) = (args[0], args[1], args[2]);

        if to == self.topology.self_name() {
            let key = base64_decode(key)?;
            self.topology.validate_key(from);
            Ok(vec![Effect::InstallPacketKey {
                node: from.to_string(),
                key,
            }])
        } else {
            if let Err(e) = self.send_to_node(to, Request::AnsKey, &[from, to, key]) {
                log::debug!("Dropping ANS_KEY {from}->{to}: {e}");
            }
            Ok(Vec::new())
        }
    }

    /// Route a point-to-point request toward `node` via its nexthop.
    fn send_to_node(&self, node: &str, request: Request, args: &[&str]) -> Result<()> {
        let target = self
            .topology
            .node(node)
            .ok_or_else(|| Error::Protocol(format!("no such node {node}")))?;
        let hop = target
            .nexthop
            .as_deref()
            .ok_or_else(|| Error::Protocol(format!("{node} is unreachable")))?;
        let conn = self
            .registry
            .lookup_by_name(hop)
            .ok_or_else(|| Error::Protocol(format!("nexthop {hop} has no connection")))?;
        conn.send(request, args)
    }

    /// Ask a node for its packet key.
    pub fn request_key(&self, node: &str) -> Result<()> {
        self.send_to_node(node, Request::ReqKey, &[self.topology.self_name(), node])
    }

    /// Rotate our packet key and announce the change to the mesh.
    pub fn rotate_packet_key(&mut self) {
        crate::checkpoint!();
        self.packet_key = new_packet_key();
        let name = self.topology.self_name().to_string();
        self.registry
            .broadcast_except(None, Request::KeyChanged, &[&name]);
        log::info!("Packet key rotated");
    }

    /// Our current packet key (handed to the data plane).
    pub fn packet_key(&self) -> &[u8] {
        &self.packet_key
    }
}

/// Adjacency predicate for nexthop recomputation, detached from the
/// registry borrow.
fn adjacency(registry: &Registry) -> impl Fn(&str) -> bool + '_ {
    move |name| registry.is_adjacent(name)
}

fn new_packet_key() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; PACKET_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(data)
        .map_err(|e| Error::Protocol(format!("bad base64 operand: {e}")))
}

fn parse_address(token: &str) -> Result<Option<IpAddr>> {
    if token == NO_ADDRESS {
        return Ok(None);
    }
    token
        .parse()
        .map(Some)
        .map_err(|_| Error::Protocol(format!("bad address '{token}'")))
}

fn format_address(address: Option<IpAddr>) -> String {
    match address {
        Some(ip) => ip.to_string(),
        None => NO_ADDRESS.to_string(),
    }
}

fn parse_subnet(token: &str) -> Result<ipnet::IpNet> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("bad subnet '{token}'")))
}

/// Reattach the newline a reader stripped, for verbatim rebroadcast.
fn line_nl(line: &str) -> String {
    let mut s = String::with_capacity(line.len() + 1);
    s.push_str(line);
    s.push('\n');
    debug_assert!(s.len() <= MAX_LINE);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn peer_block(name: &str, key: &Keypair) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            address: None,
            port: 655,
            public_key: key.public_key_base64(),
            subnets: Vec::new(),
            weight: 1,
        }
    }

    fn config_for(name: &str, subnet: &str, peers: Vec<PeerConfig>) -> Config {
        Config {
            name: name.to_string(),
            listen: "0.0.0.0".parse().expect("addr"),
            port: 655,
            subnets: vec![subnet.parse().expect("subnet")],
            connect_to: Vec::new(),
            peers,
            key_file: None,
            up_script: None,
            down_script: None,
        }
    }

    struct Pair {
        alpha: Mesh,
        bravo: Mesh,
        /// alpha's connection toward bravo.
        a_conn: ConnId,
        /// bravo's connection toward alpha.
        b_conn: ConnId,
        a_out: UnboundedReceiver<String>,
        b_out: UnboundedReceiver<String>,
    }

    fn mesh_pair() -> Pair {
        let key_a = Keypair::generate();
        let key_b = Keypair::generate();
        let alpha_cfg = config_for("alpha", "10.1.0.0/16", vec![peer_block("bravo", &key_b)]);
        let bravo_cfg = config_for("bravo", "10.2.0.0/16", vec![peer_block("alpha", &key_a)]);

        let mut alpha = Mesh::new(alpha_cfg, key_a).expect("mesh alpha");
        let mut bravo = Mesh::new(bravo_cfg, key_b).expect("mesh bravo");

        let (tx_a, a_out) = mpsc::unbounded_channel();
        let a_conn = alpha
            .add_outgoing("192.0.2.2:655".parse().expect("addr"), "bravo", tx_a)
            .expect("outgoing");
        let (tx_b, b_out) = mpsc::unbounded_channel();
        let b_conn = bravo.add_incoming("192.0.2.1:40000".parse().expect("addr"), tx_b);

        Pair {
            alpha,
            bravo,
            a_conn,
            b_conn,
            a_out,
            b_out,
        }
    }

    /// Ferry queued lines between the two meshes until both are silent.
    /// `corrupt` may rewrite a line in the alpha->bravo direction.
    fn pump(pair: &mut Pair, corrupt: impl Fn(&str) -> String) -> Result<Vec<Effect>> {
        let mut effects = Vec::new();
        loop {
            let mut quiet = true;
            while let Ok(line) = pair.a_out.try_recv() {
                quiet = false;
                let line = corrupt(line.trim_end());
                effects.extend(pair.bravo.handle_line(pair.b_conn, &line)?);
            }
            while let Ok(line) = pair.b_out.try_recv() {
                quiet = false;
                effects.extend(pair.alpha.handle_line(pair.a_conn, line.trim_end())?);
            }
            if quiet {
                return Ok(effects);
            }
        }
    }

    #[test]
    fn test_full_handshake_reaches_active() {
        let mut pair = mesh_pair();
        let effects = pump(&mut pair, |l| l.to_string()).expect("handshake");

        // Each side fetched the other's packet key once active.
        let mut installed: Vec<&str> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::InstallPacketKey { node, .. } => Some(node.as_str()),
                _ => None,
            })
            .collect();
        installed.sort_unstable();
        assert_eq!(installed, vec!["alpha", "bravo"]);

        let a = pair.alpha.registry.get(pair.a_conn).expect("conn");
        let b = pair.bravo.registry.get(pair.b_conn).expect("conn");
        assert_eq!(a.state, ConnState::Active);
        assert_eq!(b.state, ConnState::Active);
        assert_eq!(a.name.as_deref(), Some("bravo"));
        assert_eq!(b.name.as_deref(), Some("alpha"));

        // Both sides converged on the same subnet set.
        let subnets_a: Vec<String> = pair
            .alpha
            .topology
            .subnets()
            .map(|(o, s)| format!("{o} {s}"))
            .collect();
        let subnets_b: Vec<String> = pair
            .bravo
            .topology
            .subnets()
            .map(|(o, s)| format!("{o} {s}"))
            .collect();
        assert_eq!(subnets_a, subnets_b);
        assert_eq!(subnets_a.len(), 2);

        // Adjacency is in place on both ends.
        assert!(pair.alpha.topology.has_edge("alpha", "bravo"));
        assert!(pair.bravo.topology.has_edge("alpha", "bravo")
            || pair.bravo.topology.has_edge("bravo", "alpha"));
        assert_eq!(
            pair.alpha
                .topology
                .node("bravo")
                .expect("bravo known")
                .nexthop
                .as_deref(),
            Some("bravo")
        );
    }

    #[test]
    fn test_wrong_chal_reply_fails_auth() {
        let mut pair = mesh_pair();
        let bogus = base64_encode(&[0u8; 32]);
        let err = pump(&mut pair, |line| {
            if line.starts_with("3 ") {
                format!("3 {bogus}")
            } else {
                line.to_string()
            }
        })
        .expect_err("tampered digest must fail");
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut pair = mesh_pair();
        let err = pump(&mut pair, |line| {
            if line.starts_with("0 ") {
                "0 alpha 99 0".to_string()
            } else {
                line.to_string()
            }
        })
        .expect_err("newer peer version");
        assert!(matches!(err, Error::IncompatibleVersion { peer: 99, .. }));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let mut pair = mesh_pair();
        let err = pair
            .bravo
            .handle_line(pair.b_conn, "0 mallory 17 0")
            .expect_err("unknown peer");
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_outgoing_dial_identity_must_match() {
        let key_b = Keypair::generate();
        let key_c = Keypair::generate();
        let config = config_for(
            "alpha",
            "10.1.0.0/16",
            vec![peer_block("bravo", &key_b), peer_block("charlie", &key_c)],
        );
        let mut mesh = Mesh::new(config, Keypair::generate()).expect("mesh");
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = mesh
            .add_outgoing("192.0.2.2:655".parse().expect("addr"), "bravo", tx)
            .expect("dial");

        let err = mesh
            .handle_line(id, "0 charlie 17 0")
            .expect_err("peer claiming another name is refused");
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_requests_rejected_before_active() {
        let mut pair = mesh_pair();
        let err = pair
            .bravo
            .handle_line(pair.b_conn, "12 alpha 10.9.0.0/16")
            .expect_err("topology request before ACK");
        assert!(matches!(err, Error::Protocol(_)));
    }

    /// A mesh with two live, named, active connections, for fan-out
    /// tests. Returns (mesh, conn ids, outbound receivers).
    fn relay_mesh() -> (Mesh, [ConnId; 2], [UnboundedReceiver<String>; 2]) {
        let key = Keypair::generate();
        let key_a = Keypair::generate();
        let key_c = Keypair::generate();
        let config = config_for(
            "bravo",
            "10.2.0.0/16",
            vec![peer_block("alpha", &key_a), peer_block("charlie", &key_c)],
        );
        let mut mesh = Mesh::new(config, key).expect("mesh");

        let mut ids = Vec::new();
        let mut outs = Vec::new();
        for name in ["alpha", "charlie"] {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = mesh.add_incoming("192.0.2.9:1".parse().expect("addr"), tx);
            mesh.registry.bind_name(id, name).expect("bind");
            mesh.registry
                .get_mut(id)
                .expect("conn")
                .advance(ConnState::Active)
                .expect("activate");
            mesh.topology.add_edge("bravo", name, 1, 0);
            ids.push(id);
            outs.push(rx);
        }
        let is_adjacent = adjacency(&mesh.registry);
        mesh.topology.recompute_nexthops(is_adjacent);

        let [a, c] = ids.try_into().expect("two conns");
        let [rx_a, rx_c] = outs.try_into().expect("two receivers");
        (mesh, [a, c], [rx_a, rx_c])
    }

    #[test]
    fn test_broadcast_fanout_suppresses_origin() {
        let (mut mesh, [from_alpha, _], [mut rx_a, mut rx_c]) = relay_mesh();

        mesh.handle_line(from_alpha, "12 xray 10.9.0.0/16")
            .expect("subnet accepted");

        assert_eq!(
            rx_c.try_recv().expect("charlie sees the claim"),
            "12 xray 10.9.0.0/16\n"
        );
        assert!(rx_a.try_recv().is_err(), "origin must not get an echo");

        // A repeated claim is a no-op and is not forwarded again.
        mesh.handle_line(from_alpha, "12 xray 10.9.0.0/16")
            .expect("idempotent repeat");
        assert!(rx_c.try_recv().is_err(), "no-op is not rebroadcast");
    }

    #[test]
    fn test_conflicting_subnet_faults_later_claimant() {
        let (mut mesh, [from_alpha, from_charlie], _outs) = relay_mesh();

        mesh.handle_line(from_alpha, "12 xray 10.9.0.0/16")
            .expect("first claim");
        let err = mesh
            .handle_line(from_charlie, "12 yankee 10.9.4.0/24")
            .expect_err("overlapping claim");
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn test_del_edge_recomputes_nexthops() {
        let (mut mesh, [from_alpha, _], _outs) = relay_mesh();
        mesh.handle_line(from_alpha, "14 alpha delta 1 0")
            .expect("edge in");
        assert_eq!(
            mesh.topology.node("delta").expect("delta").nexthop.as_deref(),
            Some("alpha")
        );

        mesh.handle_line(from_alpha, "15 alpha delta")
            .expect("edge out");
        assert_eq!(mesh.topology.node("delta").expect("delta").nexthop, None);
    }

    #[test]
    fn test_key_changed_guard_limits_forwarding() {
        let (mut mesh, [from_alpha, _], [_rx_a, mut rx_c]) = relay_mesh();

        mesh.handle_line(from_alpha, "16 alpha").expect("first");
        assert_eq!(rx_c.try_recv().expect("forwarded"), "16 alpha\n");

        mesh.handle_line(from_alpha, "16 alpha").expect("repeat");
        assert!(rx_c.try_recv().is_err(), "guarded repeat is dropped");
    }

    #[test]
    fn test_req_key_for_self_is_answered() {
        let (mut mesh, [from_alpha, _], [mut rx_a, _rx_c]) = relay_mesh();

        mesh.handle_line(from_alpha, "17 alpha bravo")
            .expect("key request");
        let answer = rx_a.try_recv().expect("ANS_KEY sent back");
        let expected = format!("18 bravo alpha {}\n", base64_encode(mesh.packet_key()));
        assert_eq!(answer, expected);
    }

    #[test]
    fn test_req_key_forwarded_toward_target() {
        let (mut mesh, [from_alpha, _], [_rx_a, mut rx_c]) = relay_mesh();

        mesh.handle_line(from_alpha, "17 alpha charlie")
            .expect("key request relays");
        assert_eq!(rx_c.try_recv().expect("forwarded"), "17 alpha charlie\n");
    }

    #[test]
    fn test_ans_key_for_self_installs_packet_key() {
        let (mut mesh, [from_alpha, _], _outs) = relay_mesh();

        let key = base64_encode(&[7u8; 32]);
        let effects = mesh
            .handle_line(from_alpha, &format!("18 alpha bravo {key}"))
            .expect("key answer");
        match effects.as_slice() {
            [Effect::InstallPacketKey { node, key }] => {
                assert_eq!(node, "alpha");
                assert_eq!(key, &vec![7u8; 32]);
            }
            other => panic!("expected InstallPacketKey, got {other:?}"),
        }
        assert!(mesh.topology.node("alpha").expect("alpha").valid_key);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut mesh, [from_alpha, _], [mut rx_a, _rx_c]) = relay_mesh();
        mesh.handle_line(from_alpha, "8").expect("ping");
        assert_eq!(rx_a.try_recv().expect("pong"), "9\n");
    }

    #[test]
    fn test_termreq_closes_gracefully() {
        let (mut mesh, [from_alpha, _], _outs) = relay_mesh();
        let effects = mesh.handle_line(from_alpha, "7").expect("termreq");
        assert!(matches!(
            effects.as_slice(),
            [Effect::Close {
                reason: CloseReason::Graceful(_),
                ..
            }]
        ));
    }

    #[test]
    fn test_control_code_is_privileged() {
        let (mut mesh, [from_alpha, _], _outs) = relay_mesh();
        let err = mesh
            .handle_line(from_alpha, "19 6")
            .expect_err("control on meta link");
        assert!(matches!(err, Error::Protocol(_)));
    }
}
