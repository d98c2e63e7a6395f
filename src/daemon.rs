//! The daemon main loop.
//!
//! Single-threaded and cooperative: one task owns the mesh state and
//! multiplexes meta sockets, the control channel, signal events and a
//! one-second coarse tick. Socket reader/writer tasks only ferry bytes;
//! every protocol decision happens here, in receive order per
//! connection.

use crate::config::Config;
use crate::connection::ConnId;
use crate::control::{self, ControlCommand, ControlEvent, ControlServer};
use crate::dataplane::DataPlane;
use crate::error::{Error, Result};
use crate::keys::Keypair;
use crate::meta::{CloseReason, Effect, Mesh};
use crate::naming::Names;
use crate::pidfile::PidFile;
use crate::protocol::{self, Request};
use crate::signals::{self, SignalEvent};
use crate::{checkpoint, pidfile};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Idle time before an authenticated connection is pinged.
const PING_IDLE: Duration = Duration::from_secs(60);
/// Grace period for the PONG after a PING (aggregate 65 s idle).
const PING_GRACE: Duration = Duration::from_secs(5);
/// Cap on an unfinished handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Session-key rollover age.
const KEY_ROLLOVER: Duration = Duration::from_secs(3600);
/// First reconnect delay for outgoing connections.
const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
/// Reconnect delay ceiling.
const RECONNECT_CAP: Duration = Duration::from_secs(300);
/// TCP connect attempt cap.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-connection outbound flush cap during shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide daemon state, owned by the main loop. The signal
/// dispatcher never touches it; signals arrive as channel events.
#[derive(Debug)]
pub struct DaemonState {
    /// Verbosity 0..5 from repeated `-d`.
    pub debug_level: u8,
    /// Running detached from the invoking terminal.
    pub detached: bool,
    /// Cleared to leave the main loop.
    pub running: bool,
    /// Original command line, kept for crash re-exec.
    pub argv: Vec<String>,
    /// PID of the supervisor parent, while one existed.
    pub supervisor_pid: Option<i32>,
    pub started_at: Instant,
}

impl DaemonState {
    pub fn new(debug_level: u8, detached: bool, argv: Vec<String>) -> Self {
        Self {
            debug_level,
            detached,
            running: true,
            argv,
            supervisor_pid: None,
            started_at: Instant::now(),
        }
    }
}

/// Map the `-d` count onto the log filter.
pub fn level_filter(debug_level: u8) -> log::LevelFilter {
    match debug_level {
        0 => log::LevelFilter::Info,
        1 | 2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// What the liveness check decided for one connection.
#[derive(Debug, PartialEq, Eq)]
enum Liveness {
    Fine,
    SendPing,
    Expired,
}

fn liveness_verdict(
    authenticated: bool,
    idle: Duration,
    pinged: bool,
    handshake_age: Duration,
) -> Liveness {
    if !authenticated {
        if handshake_age >= HANDSHAKE_TIMEOUT {
            return Liveness::Expired;
        }
        return Liveness::Fine;
    }
    if pinged {
        if idle >= PING_IDLE + PING_GRACE {
            return Liveness::Expired;
        }
    } else if idle >= PING_IDLE {
        return Liveness::SendPing;
    }
    Liveness::Fine
}

/// Reconnect delay for the n-th attempt (1-based): 5 s doubling up to
/// 300 s.
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    RECONNECT_INITIAL
        .saturating_mul(factor as u32)
        .min(RECONNECT_CAP)
}

#[derive(Debug)]
enum Event {
    /// One meta-line arrived on a connection.
    Line { id: ConnId, line: String },
    /// A connection's reader finished.
    Closed { id: ConnId, error: Option<Error> },
    /// An outgoing dial completed.
    Connected { target: String, stream: TcpStream },
    /// An outgoing dial failed.
    ConnectFailed { target: String, error: String },
}

#[derive(Debug)]
struct Retry {
    attempt: u32,
    due: Instant,
}

/// The daemon: mesh state plus the I/O scaffolding around it.
pub struct Daemon {
    pub state: DaemonState,
    pub mesh: Mesh,
    names: Names,
    plane: Box<dyn DataPlane>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
    signal_tx: mpsc::UnboundedSender<SignalEvent>,
    signal_rx: Option<mpsc::UnboundedReceiver<SignalEvent>>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: Option<mpsc::UnboundedReceiver<ControlEvent>>,

    reader_tasks: HashMap<ConnId, JoinHandle<()>>,
    writer_tasks: HashMap<ConnId, JoinHandle<()>>,
    /// Outgoing connection id -> configured peer it dialed.
    dials: HashMap<ConnId, String>,
    /// Dials currently in flight.
    pending_dials: HashSet<String>,
    /// Reconnect schedule per configured peer.
    retries: HashMap<String, Retry>,

    /// TCP connect attempt cap, overridable with `-t`.
    connect_timeout: Duration,
    key_rotated_at: Instant,
    pid_file: Option<PidFile>,
}

impl Daemon {
    pub fn new(
        config: Config,
        keypair: Keypair,
        names: Names,
        plane: Box<dyn DataPlane>,
        state: DaemonState,
    ) -> Result<Self> {
        let mesh = Mesh::new(config, keypair)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Self {
            state,
            mesh,
            names,
            plane,
            events_tx,
            events_rx: Some(events_rx),
            signal_tx,
            signal_rx: Some(signal_rx),
            control_tx,
            control_rx: Some(control_rx),
            reader_tasks: HashMap::new(),
            writer_tasks: HashMap::new(),
            dials: HashMap::new(),
            pending_dials: HashSet::new(),
            retries: HashMap::new(),
            connect_timeout: CONNECT_TIMEOUT,
            key_rotated_at: Instant::now(),
            pid_file: None,
        })
    }

    /// Override the connect timeout (`-t SECONDS`).
    pub fn set_timeout(&mut self, seconds: u64) {
        self.connect_timeout = Duration::from_secs(seconds.max(1));
    }

    /// Run until shutdown. Consumes the PID-file guard; the file is
    /// removed on the graceful path.
    pub async fn run(&mut self, pid_file: PidFile) -> Result<()> {
        checkpoint!();
        self.pid_file = Some(pid_file);

        signals::spawn_listener(self.signal_tx.clone())?;
        signals::install_diagnostic_handlers();

        self.plane.start()?;
        self.install_own_key();

        let listener =
            TcpListener::bind((self.mesh.config.listen, self.mesh.config.port)).await?;
        log::info!(
            "Listening for meta-connections on {}:{}",
            self.mesh.config.listen,
            self.mesh.config.port
        );

        let control = ControlServer::bind(&self.names.control_socket)?;
        tokio::spawn(control.run(self.control_tx.clone()));

        if let Some(script) = self.mesh.config.up_script.clone() {
            self.run_script(&script);
        }

        for target in self.mesh.config.connect_to.clone() {
            self.start_dial(&target);
        }

        let mut events_rx = self.events_rx.take().expect("run() called once");
        let mut signal_rx = self.signal_rx.take().expect("run() called once");
        let mut control_rx = self.control_rx.take().expect("run() called once");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.state.running {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept_meta(stream, addr),
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
                Some(event) = events_rx.recv() => self.handle_event(event),
                Some(event) = signal_rx.recv() => self.handle_signal(event),
                Some(event) = control_rx.recv() => self.handle_control(event),
                _ = tick.tick() => self.handle_tick(),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn accept_meta(&mut self, stream: TcpStream, addr: SocketAddr) {
        checkpoint!();
        log::debug!("Accepted meta-connection from {addr}");
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let id = self.mesh.add_incoming(addr, outbound_tx);
        self.spawn_io(id, stream, outbound_rx);
    }

    /// Start reader and writer tasks for an established socket.
    fn spawn_io(
        &mut self,
        id: ConnId,
        stream: TcpStream,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let (read_half, mut write_half) = stream.into_split();

        let writer = tokio::spawn(async move {
            // Receiving `None` means the connection was dropped; the
            // queue has been fully drained by then, so this flushes all
            // pending output before closing the socket.
            while let Some(line) = outbound_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });
        self.writer_tasks.insert(id, writer);

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match protocol::read_frame(&mut reader).await {
                    Ok(Some(line)) => {
                        if events.send(Event::Line { id, line }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = events.send(Event::Closed { id, error: None });
                        break;
                    }
                    Err(e) => {
                        let _ = events.send(Event::Closed { id, error: Some(e) });
                        break;
                    }
                }
            }
        });
        self.reader_tasks.insert(id, reader);
    }

    /// Begin an outgoing dial to a configured peer.
    fn start_dial(&mut self, target: &str) {
        if self.pending_dials.contains(target)
            || self.mesh.registry.lookup_by_name(target).is_some()
        {
            return;
        }
        let Some(peer) = self.mesh.config.peer(target) else {
            log::warn!("Cannot connect to unknown peer {target}");
            return;
        };
        let Some(addr) = peer.meta_addr() else {
            log::warn!("Peer {target} has no address to connect to");
            return;
        };

        log::info!("Trying to connect to {target} ({addr})");
        self.pending_dials.insert(target.to_string());
        let events = self.events_tx.clone();
        let target = target.to_string();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await;
            let event = match result {
                Ok(Ok(stream)) => Event::Connected { target, stream },
                Ok(Err(e)) => Event::ConnectFailed {
                    target,
                    error: e.to_string(),
                },
                Err(_) => Event::ConnectFailed {
                    target,
                    error: "connection timed out".to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Line { id, line } => match self.mesh.handle_line(id, &line) {
                Ok(effects) => self.apply_effects(effects),
                Err(e) => self.close_connection(id, CloseReason::Faulted(e)),
            },
            Event::Closed { id, error } => {
                let reason = match error {
                    Some(e) => CloseReason::Faulted(e),
                    None => CloseReason::Graceful("connection closed by peer".to_string()),
                };
                self.close_connection(id, reason);
            }
            Event::Connected { target, stream } => {
                self.pending_dials.remove(&target);
                if self.mesh.config.peer(&target).is_none() {
                    // Configuration changed while the dial was in
                    // flight.
                    return;
                }
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("placeholder addr"));
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                match self.mesh.add_outgoing(addr, &target, outbound_tx) {
                    Ok(id) => {
                        log::info!("Connected to {target} ({addr})");
                        self.retries.remove(&target);
                        self.dials.insert(id, target);
                        self.spawn_io(id, stream, outbound_rx);
                    }
                    Err(e) => {
                        log::warn!("Failed to set up connection with {target}: {e}");
                        self.schedule_retry(&target);
                    }
                }
            }
            Event::ConnectFailed { target, error } => {
                self.pending_dials.remove(&target);
                log::info!("Could not connect to {target}: {error}");
                self.schedule_retry(&target);
            }
        }
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Close { id, reason } => self.close_connection(id, reason),
                Effect::InstallPacketKey { node, key } => {
                    self.plane.install_key(&node, &key);
                }
            }
        }
    }

    /// Tear down one connection: release it from the registry, retract
    /// the adjacency, and schedule a reconnect for outgoing dials.
    fn close_connection(&mut self, id: ConnId, reason: CloseReason) {
        checkpoint!();
        let Some(conn) = self.mesh.registry.remove(id) else {
            return;
        };
        match &reason {
            CloseReason::Graceful(msg) => {
                log::info!("Closing connection with {}: {msg}", conn.label());
            }
            CloseReason::Faulted(e) => {
                log::warn!("Closing connection with {}: {e}", conn.label());
            }
        }

        if let Some(handle) = self.reader_tasks.remove(&id) {
            handle.abort();
        }
        // The writer drains the queue and exits once `conn` drops.
        self.writer_tasks.remove(&id);

        if conn.authenticated() {
            if let Some(name) = conn.name.clone() {
                let self_name = self.mesh.self_name().to_string();
                let removed_out = self.mesh.topology.del_edge(&self_name, &name);
                let removed_in = self.mesh.topology.del_edge(&name, &self_name);
                if removed_out || removed_in {
                    let registry = &self.mesh.registry;
                    self.mesh
                        .topology
                        .recompute_nexthops(|n| registry.is_adjacent(n));
                    if removed_out {
                        self.mesh.registry.broadcast_except(
                            None,
                            Request::DelEdge,
                            &[&self_name, &name],
                        );
                    }
                    if removed_in {
                        self.mesh.registry.broadcast_except(
                            None,
                            Request::DelEdge,
                            &[&name, &self_name],
                        );
                    }
                }
            }
        }
        drop(conn);

        if let Some(target) = self.dials.remove(&id) {
            if self.state.running {
                self.schedule_retry(&target);
            }
        }
    }

    fn schedule_retry(&mut self, target: &str) {
        let entry = self.retries.entry(target.to_string()).or_insert(Retry {
            attempt: 0,
            due: Instant::now(),
        });
        entry.attempt += 1;
        let delay = retry_delay(entry.attempt);
        entry.due = Instant::now() + delay;
        log::info!(
            "Trying to re-establish connection with {target} in {} seconds",
            delay.as_secs()
        );
    }

    fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Terminate => {
                log::info!("Got TERM signal");
                self.state.running = false;
            }
            SignalEvent::Reload => {
                log::info!("Got HUP signal");
                self.reload();
            }
            SignalEvent::DumpTables => self.dump_tables(),
            SignalEvent::RotateKeys => {
                log::info!("Forcing new keys");
                self.rotate_keys();
            }
            SignalEvent::Alarm => log::debug!("Got ALRM signal"),
            SignalEvent::ReapChildren => reap_children(),
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        checkpoint!();
        let reply = |line: String| {
            let _ = event.reply.send(line);
        };
        match event.command {
            ControlCommand::Stop => {
                reply(control::ack_line());
                log::info!("Shutdown requested over the control channel");
                self.state.running = false;
            }
            ControlCommand::Reload => {
                self.reload();
                reply(control::ack_line());
            }
            ControlCommand::DumpNodes => {
                for line in control::dump_nodes(&self.mesh.topology) {
                    reply(line);
                }
            }
            ControlCommand::DumpEdges => {
                for line in control::dump_edges(&self.mesh.topology) {
                    reply(line);
                }
            }
            ControlCommand::DumpSubnets => {
                for line in control::dump_subnets(&self.mesh.topology) {
                    reply(line);
                }
            }
            ControlCommand::DumpConnections => {
                for line in control::dump_connections(&self.mesh.registry) {
                    reply(line);
                }
            }
            ControlCommand::DumpTraffic => {
                for line in control::dump_traffic(&self.mesh.topology) {
                    reply(line);
                }
            }
            ControlCommand::Purge => {
                let purged = self.mesh.topology.purge();
                if !purged.is_empty() {
                    log::info!("Purged {} unreachable node(s)", purged.len());
                }
                reply(control::ack_line());
            }
            ControlCommand::SetDebug(level) => {
                log::info!(
                    "Debug level changed from {} to {level}",
                    self.state.debug_level
                );
                self.state.debug_level = level;
                log::set_max_level(level_filter(level));
                reply(control::ack_line());
            }
            ControlCommand::Retry => {
                let now = Instant::now();
                for retry in self.retries.values_mut() {
                    retry.due = now;
                }
                reply(control::ack_line());
            }
        }
    }

    fn handle_tick(&mut self) {
        while let Some(signo) = signals::take_unexpected() {
            log::warn!(
                "Got unexpected signal ({signo}) {}",
                crate::checkpoint::describe()
            );
        }

        self.check_liveness();
        self.run_due_retries();

        if self.key_rotated_at.elapsed() >= KEY_ROLLOVER {
            log::info!("Regenerating session key after rollover interval");
            self.rotate_keys();
        }

        self.accumulate_traffic();
    }

    fn check_liveness(&mut self) {
        let now = Instant::now();
        let mut pings = Vec::new();
        let mut expired = Vec::new();
        for conn in self.mesh.registry.scan() {
            let idle = now.duration_since(conn.last_activity);
            let handshake_age = now.duration_since(conn.established_at);
            match liveness_verdict(conn.authenticated(), idle, conn.pinged, handshake_age) {
                Liveness::Fine => {}
                Liveness::SendPing => pings.push(conn.id),
                Liveness::Expired => expired.push(conn.id),
            }
        }

        for id in pings {
            if let Some(conn) = self.mesh.registry.get_mut(id) {
                if conn.send(Request::Ping, &[]).is_ok() {
                    conn.pinged = true;
                } else {
                    expired.push(id);
                }
            }
        }
        for id in expired {
            let label = self
                .mesh
                .registry
                .get(id)
                .map(|c| c.label())
                .unwrap_or_default();
            self.close_connection(
                id,
                CloseReason::Faulted(Error::Timeout(format!("{label} did not respond"))),
            );
        }
    }

    fn run_due_retries(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .retries
            .iter()
            .filter(|(target, retry)| {
                retry.due <= now
                    && !self.pending_dials.contains(*target)
                    && self.mesh.registry.lookup_by_name(target).is_none()
            })
            .map(|(target, _)| target.clone())
            .collect();
        for target in due {
            // Push the schedule forward so a failing dial is not
            // retried every tick; a successful dial clears the entry.
            if let Some(retry) = self.retries.get_mut(&target) {
                retry.due = now + retry_delay(retry.attempt + 1);
            }
            self.start_dial(&target);
        }
    }

    fn rotate_keys(&mut self) {
        self.mesh.rotate_packet_key();
        self.install_own_key();
        self.key_rotated_at = Instant::now();
    }

    fn install_own_key(&mut self) {
        let name = self.mesh.self_name().to_string();
        let key = self.mesh.packet_key().to_vec();
        self.plane.install_key(&name, &key);
    }

    fn accumulate_traffic(&mut self) {
        for traffic in self.plane.poll_counters() {
            if let Some(counters) = self.mesh.topology.counters_mut(&traffic.node) {
                let d = traffic.delta;
                counters.tap_in_packets += d.tap_in_packets;
                counters.tap_in_bytes += d.tap_in_bytes;
                counters.tap_out_packets += d.tap_out_packets;
                counters.tap_out_bytes += d.tap_out_bytes;
                counters.socket_in_packets += d.socket_in_packets;
                counters.socket_in_bytes += d.socket_in_bytes;
                counters.socket_out_packets += d.socket_out_packets;
                counters.socket_out_bytes += d.socket_out_bytes;
            } else {
                log::debug!("Traffic for unknown node {}", traffic.node);
            }
        }
    }

    /// Dump the connection and topology tables to the log (USR1).
    fn dump_tables(&self) {
        log::info!("Connections:");
        for conn in self.mesh.registry.scan() {
            log::info!(
                "  {} at {} ({:?}{})",
                conn.label(),
                conn.addr,
                conn.state,
                if conn.outgoing { ", outgoing" } else { "" }
            );
        }
        log::info!("Nodes:");
        for node in self.mesh.topology.nodes() {
            log::info!(
                "  {} nexthop {} subnets {}",
                node.name,
                node.nexthop.as_deref().unwrap_or("-"),
                node.subnets.len()
            );
        }
        log::info!("Edges:");
        for (from, to, info) in self.mesh.topology.edges() {
            log::info!("  {from} -> {to} weight {}", info.weight);
        }
        log::info!("End of tables.");
    }

    /// Tear the mesh and the plane down, reparse the configuration and
    /// come back up. A parse failure keeps the old configuration and
    /// leaves the daemon idle until the next reload.
    pub fn reload(&mut self) -> bool {
        checkpoint!();
        log::info!("Reloading configuration");

        for id in self.mesh.registry.ids() {
            if let Some(conn) = self.mesh.registry.get_mut(id) {
                let _ = conn.send(Request::TermReq, &[]);
                conn.termreq_sent = true;
            }
            self.close_connection(id, CloseReason::Graceful("reload".to_string()));
        }
        self.retries.clear();
        self.dials.clear();
        self.plane.stop();

        let config = match Config::load(&self.names.config_file) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Reload failed, keeping old configuration: {e}");
                return false;
            }
        };
        let key_file = config.key_file_in(&self.names.config_base);
        let keypair = match Keypair::load_or_generate(&key_file) {
            Ok(keypair) => keypair,
            Err(e) => {
                log::error!("Reload failed, keeping old configuration: {e}");
                return false;
            }
        };
        let mesh = match Mesh::new(config, keypair) {
            Ok(mesh) => mesh,
            Err(e) => {
                log::error!("Reload failed, keeping old configuration: {e}");
                return false;
            }
        };

        self.mesh = mesh;
        if let Err(e) = self.plane.start() {
            log::warn!("Data plane failed to restart: {e}");
            return false;
        }
        self.install_own_key();
        for target in self.mesh.config.connect_to.clone() {
            self.start_dial(&target);
        }
        true
    }

    /// Graceful shutdown: notify peers, flush queues, stop the plane,
    /// remove the runtime files.
    async fn shutdown(&mut self) {
        checkpoint!();
        log::info!("Terminating");

        for conn in self.mesh.registry.scan_mut() {
            if conn.send(Request::TermReq, &[]).is_ok() {
                conn.termreq_sent = true;
            }
        }
        for id in self.mesh.registry.ids() {
            if let Some(handle) = self.reader_tasks.remove(&id) {
                handle.abort();
            }
            self.mesh.registry.remove(id);
        }

        // Writers drain their queues once the senders are gone.
        let writers: Vec<_> = self.writer_tasks.drain().map(|(_, handle)| handle).collect();
        for handle in writers {
            if tokio::time::timeout(FLUSH_TIMEOUT, handle).await.is_err() {
                log::debug!("Outbound flush timed out, discarding socket");
            }
        }

        self.plane.stop();
        if let Some(script) = self.mesh.config.down_script.clone() {
            self.run_script(&script);
        }

        let totals = self.traffic_totals();
        log::info!(
            "Total bytes written: tap {}, socket {}; bytes read: tap {}, socket {}.",
            totals.tap_out_bytes,
            totals.socket_out_bytes,
            totals.tap_in_bytes,
            totals.socket_in_bytes
        );

        let _ = std::fs::remove_file(&self.names.control_socket);
        if let Some(mut pid_file) = self.pid_file.take() {
            pid_file.release();
        } else {
            pidfile::remove_pid(&self.names.pid_file);
        }
    }

    fn traffic_totals(&self) -> crate::topology::TrafficCounters {
        let mut totals = crate::topology::TrafficCounters::default();
        for node in self.mesh.topology.nodes() {
            totals.tap_in_bytes += node.counters.tap_in_bytes;
            totals.tap_out_bytes += node.counters.tap_out_bytes;
            totals.socket_in_bytes += node.counters.socket_in_bytes;
            totals.socket_out_bytes += node.counters.socket_out_bytes;
        }
        totals
    }

    /// Launch a configuration script, fire-and-forget; SIGCHLD reaping
    /// collects it.
    fn run_script(&self, command: &str) {
        log::info!("Running script: {command}");
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(net) = &self.names.netname {
            cmd.env("NETNAME", net);
        }
        cmd.env("NODENAME", &self.mesh.config.name);
        match cmd.spawn() {
            Ok(child) => log::debug!("Script started with pid {}", child.id()),
            Err(e) => log::warn!("Script failed to start: {e}"),
        }
    }
}

/// Collect exited script children without blocking.
fn reap_children() {
    loop {
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        log::debug!("Reaped child {pid}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::connection::ConnState;
    use crate::dataplane::{NodeTraffic, NullDataPlane};
    use crate::topology::TrafficCounters;

    fn test_config(name: &str, peers: Vec<PeerConfig>, connect_to: Vec<String>) -> Config {
        Config {
            name: name.to_string(),
            listen: "127.0.0.1".parse().expect("addr"),
            port: 0,
            subnets: vec!["10.1.0.0/16".parse().expect("subnet")],
            connect_to,
            peers,
            key_file: None,
            up_script: None,
            down_script: None,
        }
    }

    fn peer_block(name: &str, key: &Keypair) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            address: Some("127.0.0.1".parse().expect("addr")),
            port: 65535,
            public_key: key.public_key_base64(),
            subnets: Vec::new(),
            weight: 1,
        }
    }

    fn test_daemon(config: Config, dir: &std::path::Path) -> Daemon {
        let names = Names::with_roots(Some("test"), dir, dir);
        let state = DaemonState::new(0, false, vec!["tincd".to_string()]);
        Daemon::new(
            config,
            Keypair::generate(),
            names,
            Box::new(NullDataPlane::new()),
            state,
        )
        .expect("daemon")
    }

    #[test]
    fn test_liveness_verdicts() {
        let s = Duration::from_secs;
        // Handshake within its window.
        assert_eq!(liveness_verdict(false, s(0), false, s(3)), Liveness::Fine);
        assert_eq!(
            liveness_verdict(false, s(0), false, s(10)),
            Liveness::Expired
        );
        // Authenticated: ping at 60s idle, expire at 65s.
        assert_eq!(liveness_verdict(true, s(59), false, s(99)), Liveness::Fine);
        assert_eq!(
            liveness_verdict(true, s(60), false, s(99)),
            Liveness::SendPing
        );
        assert_eq!(liveness_verdict(true, s(64), true, s(99)), Liveness::Fine);
        assert_eq!(liveness_verdict(true, s(65), true, s(99)), Liveness::Expired);
    }

    #[test]
    fn test_retry_delays_double_up_to_cap() {
        assert_eq!(retry_delay(1), Duration::from_secs(5));
        assert_eq!(retry_delay(2), Duration::from_secs(10));
        assert_eq!(retry_delay(3), Duration::from_secs(20));
        assert_eq!(retry_delay(6), Duration::from_secs(160));
        assert_eq!(retry_delay(7), Duration::from_secs(300));
        assert_eq!(retry_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn test_level_filter_mapping() {
        assert_eq!(level_filter(0), log::LevelFilter::Info);
        assert_eq!(level_filter(2), log::LevelFilter::Debug);
        assert_eq!(level_filter(5), log::LevelFilter::Trace);
    }

    #[tokio::test]
    async fn test_close_connection_retracts_edges_and_schedules_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_b = Keypair::generate();
        let key_c = Keypair::generate();
        let config = test_config(
            "alpha",
            vec![peer_block("bravo", &key_b), peer_block("charlie", &key_c)],
            vec!["bravo".to_string()],
        );
        let mut daemon = test_daemon(config, dir.path());

        // An authenticated outgoing connection to bravo.
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let bravo = daemon
            .mesh
            .add_outgoing("127.0.0.1:655".parse().expect("addr"), "bravo", tx_b)
            .expect("outgoing");
        daemon.mesh.registry.bind_name(bravo, "bravo").expect("bind");
        daemon
            .mesh
            .registry
            .get_mut(bravo)
            .expect("conn")
            .advance(ConnState::Active)
            .expect("activate");
        daemon.dials.insert(bravo, "bravo".to_string());
        daemon.mesh.topology.add_edge("alpha", "bravo", 1, 0);
        daemon.mesh.topology.add_edge("bravo", "alpha", 1, 0);

        // A second active connection observing the broadcasts.
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        let charlie = daemon.mesh.add_incoming("127.0.0.1:9999".parse().expect("addr"), tx_c);
        daemon
            .mesh
            .registry
            .bind_name(charlie, "charlie")
            .expect("bind");
        daemon
            .mesh
            .registry
            .get_mut(charlie)
            .expect("conn")
            .advance(ConnState::Active)
            .expect("activate");

        daemon.close_connection(bravo, CloseReason::Graceful("test".to_string()));

        assert!(daemon.mesh.registry.lookup_by_name("bravo").is_none());
        assert!(!daemon.mesh.topology.has_edge("alpha", "bravo"));
        assert!(!daemon.mesh.topology.has_edge("bravo", "alpha"));

        let mut broadcasts = Vec::new();
        while let Ok(line) = rx_c.try_recv() {
            broadcasts.push(line);
        }
        assert!(broadcasts.contains(&"15 alpha bravo\n".to_string()));
        assert!(broadcasts.contains(&"15 bravo alpha\n".to_string()));

        let retry = daemon.retries.get("bravo").expect("retry scheduled");
        assert_eq!(retry.attempt, 1);
    }

    #[tokio::test]
    async fn test_control_stop_clears_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config("alpha", Vec::new(), Vec::new());
        let mut daemon = test_daemon(config, dir.path());

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        daemon.handle_control(ControlEvent {
            command: ControlCommand::Stop,
            reply: reply_tx,
        });

        assert!(!daemon.state.running);
        assert_eq!(reply_rx.try_recv().expect("ack"), "4\n");
    }

    #[tokio::test]
    async fn test_reload_with_bad_config_keeps_old() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config("alpha", Vec::new(), Vec::new());
        let mut daemon = test_daemon(config, dir.path());

        std::fs::create_dir_all(daemon.names.config_base.clone()).expect("config dir");
        std::fs::write(&daemon.names.config_file, "name = [broken").expect("write config");

        assert!(!daemon.reload());
        assert_eq!(daemon.mesh.config.name, "alpha");
    }

    #[tokio::test]
    async fn test_reload_with_new_config_rebuilds_mesh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config("alpha", Vec::new(), Vec::new());
        let mut daemon = test_daemon(config, dir.path());

        std::fs::create_dir_all(daemon.names.config_base.clone()).expect("config dir");
        std::fs::write(
            &daemon.names.config_file,
            "name = \"omega\"\nsubnets = [\"10.7.0.0/16\"]\n",
        )
        .expect("write config");

        assert!(daemon.reload());
        assert_eq!(daemon.mesh.config.name, "omega");
        assert!(daemon
            .mesh
            .topology
            .subnets()
            .any(|(owner, subnet)| owner == "omega" && subnet.to_string() == "10.7.0.0/16"));
    }

    #[tokio::test]
    async fn test_traffic_accumulation_updates_topology() {
        struct FeedPlane(Vec<NodeTraffic>);
        impl DataPlane for FeedPlane {
            fn start(&mut self) -> Result<()> {
                Ok(())
            }
            fn stop(&mut self) {}
            fn install_key(&mut self, _node: &str, _key: &[u8]) {}
            fn poll_counters(&mut self) -> Vec<NodeTraffic> {
                std::mem::take(&mut self.0)
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config("alpha", Vec::new(), Vec::new());
        let names = Names::with_roots(Some("test"), dir.path(), dir.path());
        let state = DaemonState::new(0, false, vec!["tincd".to_string()]);
        let plane = FeedPlane(vec![NodeTraffic {
            node: "alpha".to_string(),
            delta: TrafficCounters {
                socket_in_packets: 3,
                socket_in_bytes: 300,
                ..TrafficCounters::default()
            },
        }]);
        let mut daemon =
            Daemon::new(config, Keypair::generate(), names, Box::new(plane), state)
                .expect("daemon");

        daemon.accumulate_traffic();
        let counters = daemon
            .mesh
            .topology
            .node("alpha")
            .expect("alpha")
            .counters;
        assert_eq!(counters.socket_in_packets, 3);
        assert_eq!(counters.socket_in_bytes, 300);
    }
}
