//! The local administrative control channel.
//!
//! A UNIX-domain listener next to the PID file speaks the meta-protocol
//! framing with the privileged [`ControlRequest`] codeset. Only the
//! daemon's own user may connect, verified through the socket's peer
//! credentials. The daemon greets with `19 <version> <pid>`; the client
//! must answer `19 <cookie>` before any request is accepted.
//!
//! Requests are forwarded to the main loop as [`ControlEvent`]s; reply
//! lines stream back through the event's channel. Dump replies end
//! with a sentinel line carrying the request code and no operands,
//! which is the observer's frame boundary.

use crate::error::{Error, Result};
use crate::protocol::{
    self, parse_line, ControlRequest, Request, CONTROL_COOKIE, PROTOCOL_VERSION,
};
use crate::registry::Registry;
use crate::topology::Topology;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

/// A validated administrative command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Reload,
    DumpNodes,
    DumpEdges,
    DumpSubnets,
    DumpConnections,
    DumpTraffic,
    Purge,
    SetDebug(u8),
    Retry,
}

/// One request from a control client, with its reply channel.
#[derive(Debug)]
pub struct ControlEvent {
    pub command: ControlCommand,
    pub reply: mpsc::UnboundedSender<String>,
}

/// Parse one client line into a command.
pub fn parse_control_line(line: &str) -> Result<ControlCommand> {
    let parsed = parse_line(line)?;
    if parsed.request != Request::Control {
        return Err(Error::Protocol(format!(
            "{} is not a control request",
            parsed.request.name()
        )));
    }
    let code: u8 = parsed.args[0]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad control code '{}'", parsed.args[0])))?;
    let request = ControlRequest::from_code(code)
        .ok_or_else(|| Error::Protocol(format!("unknown control code {code}")))?;

    let command = match request {
        ControlRequest::Stop => ControlCommand::Stop,
        ControlRequest::Reload => ControlCommand::Reload,
        ControlRequest::DumpNodes => ControlCommand::DumpNodes,
        ControlRequest::DumpEdges => ControlCommand::DumpEdges,
        ControlRequest::DumpSubnets => ControlCommand::DumpSubnets,
        ControlRequest::DumpConnections => ControlCommand::DumpConnections,
        ControlRequest::DumpTraffic => ControlCommand::DumpTraffic,
        ControlRequest::Purge => ControlCommand::Purge,
        ControlRequest::SetDebug => {
            let level: u8 = parsed
                .args
                .get(1)
                .ok_or_else(|| Error::Protocol("SET_DEBUG needs a level".to_string()))?
                .parse()
                .map_err(|_| Error::Protocol("bad debug level".to_string()))?;
            ControlCommand::SetDebug(level.min(5))
        }
        ControlRequest::Retry => ControlCommand::Retry,
    };
    Ok(command)
}

/// The daemon's greeting line.
pub fn greeting() -> String {
    format!(
        "{} {} {}\n",
        Request::Control.as_code(),
        PROTOCOL_VERSION,
        std::process::id()
    )
}

/// Check the client's cookie line.
pub fn check_cookie(line: &str) -> Result<()> {
    let parsed = parse_line(line)?;
    if parsed.request != Request::Control || parsed.args.len() != 1 {
        return Err(Error::Protocol("malformed control cookie".to_string()));
    }
    let cookie: u32 = parsed.args[0]
        .parse()
        .map_err(|_| Error::Protocol("malformed control cookie".to_string()))?;
    if cookie != CONTROL_COOKIE {
        return Err(Error::Auth("control cookie mismatch".to_string()));
    }
    Ok(())
}

/// Positive acknowledgement line.
pub fn ack_line() -> String {
    format!("{}\n", Request::Ack.as_code())
}

fn dump_prefix(request: ControlRequest) -> String {
    format!("{} {}", Request::Control.as_code(), request.as_code())
}

/// Sentinel terminating one dump block.
pub fn sentinel(request: ControlRequest) -> String {
    format!("{}\n", dump_prefix(request))
}

/// `DUMP_NODES` block: name fingerprint address port nexthop subnets.
pub fn dump_nodes(topology: &Topology) -> Vec<String> {
    let prefix = dump_prefix(ControlRequest::DumpNodes);
    let mut lines: Vec<String> = topology
        .nodes()
        .map(|node| {
            let address = node
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            let nexthop = node.nexthop.as_deref().unwrap_or("-");
            format!(
                "{prefix} {} {} {} {} {} {}\n",
                node.name,
                if node.fingerprint.is_empty() { "-" } else { &node.fingerprint },
                address,
                node.port,
                nexthop,
                node.subnets.len()
            )
        })
        .collect();
    lines.push(sentinel(ControlRequest::DumpNodes));
    lines
}

/// `DUMP_EDGES` block: from to weight options.
pub fn dump_edges(topology: &Topology) -> Vec<String> {
    let prefix = dump_prefix(ControlRequest::DumpEdges);
    let mut lines: Vec<String> = topology
        .edges()
        .map(|(from, to, info)| format!("{prefix} {from} {to} {} {}\n", info.weight, info.options))
        .collect();
    lines.push(sentinel(ControlRequest::DumpEdges));
    lines
}

/// `DUMP_SUBNETS` block: subnet owner.
pub fn dump_subnets(topology: &Topology) -> Vec<String> {
    let prefix = dump_prefix(ControlRequest::DumpSubnets);
    let mut lines: Vec<String> = topology
        .subnets()
        .map(|(owner, subnet)| format!("{prefix} {subnet} {owner}\n"))
        .collect();
    lines.push(sentinel(ControlRequest::DumpSubnets));
    lines
}

/// `DUMP_CONNECTIONS` block: name address state flags.
pub fn dump_connections(registry: &Registry) -> Vec<String> {
    let prefix = dump_prefix(ControlRequest::DumpConnections);
    let mut entries: Vec<String> = registry
        .scan()
        .map(|conn| {
            format!(
                "{prefix} {} {} {:?} {}{}{}\n",
                conn.name.as_deref().unwrap_or("-"),
                conn.addr,
                conn.state,
                if conn.outgoing { 'o' } else { 'i' },
                if conn.pinged { 'p' } else { '-' },
                if conn.termreq_sent { 't' } else { '-' },
            )
        })
        .collect();
    entries.sort();
    entries.push(sentinel(ControlRequest::DumpConnections));
    entries
}

/// `DUMP_TRAFFIC` block: name in_pkts in_bytes out_pkts out_bytes, in
/// lexicographic node order. The quad is the mesh-side traffic
/// exchanged with each node.
pub fn dump_traffic(topology: &Topology) -> Vec<String> {
    let prefix = dump_prefix(ControlRequest::DumpTraffic);
    let mut lines: Vec<String> = topology
        .nodes()
        .map(|node| {
            let c = &node.counters;
            format!(
                "{prefix} {} {} {} {} {}\n",
                node.name,
                c.socket_in_packets,
                c.socket_in_bytes,
                c.socket_out_packets,
                c.socket_out_bytes
            )
        })
        .collect();
    lines.push(sentinel(ControlRequest::DumpTraffic));
    lines
}

/// The control listener. Binding removes a stale socket file first;
/// the file is unlinked again on drop.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept control clients forever, forwarding their requests to
    /// `events`.
    pub async fn run(self, events: mpsc::UnboundedSender<ControlEvent>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, events).await {
                            log::debug!("Control client: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control accept failed: {e}");
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_client(
    stream: UnixStream,
    events: mpsc::UnboundedSender<ControlEvent>,
) -> Result<()> {
    // Access control: only the owning user.
    let cred = stream.peer_cred()?;
    let our_uid = unsafe { libc::geteuid() };
    if cred.uid() != our_uid {
        return Err(Error::Auth(format!(
            "control connection from uid {} refused",
            cred.uid()
        )));
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(greeting().as_bytes()).await?;

    let cookie = protocol::read_frame(&mut reader)
        .await?
        .ok_or_else(|| Error::Protocol("client hung up before cookie".to_string()))?;
    check_cookie(&cookie)?;

    // Replies flow through a queue so the main loop never blocks on a
    // slow client.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = reply_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    loop {
        let Some(line) = protocol::read_frame(&mut reader).await? else {
            break;
        };
        if line.is_empty() {
            continue;
        }
        let command = parse_control_line(&line)?;
        if events
            .send(ControlEvent {
                command,
                reply: reply_tx.clone(),
            })
            .is_err()
        {
            break;
        }
    }

    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    #[test]
    fn test_parse_control_requests() {
        assert_eq!(parse_control_line("19 0").expect("stop"), ControlCommand::Stop);
        assert_eq!(
            parse_control_line("19 6").expect("traffic"),
            ControlCommand::DumpTraffic
        );
        assert_eq!(
            parse_control_line("19 8 3").expect("set debug"),
            ControlCommand::SetDebug(3)
        );
        assert!(parse_control_line("19 99").is_err());
        assert!(parse_control_line("8").is_err(), "meta code is not control");
        assert!(parse_control_line("19 8").is_err(), "SET_DEBUG needs level");
    }

    #[test]
    fn test_cookie_check() {
        let good = format!("19 {CONTROL_COOKIE}");
        check_cookie(&good).expect("valid cookie");
        assert!(check_cookie("19 12345").is_err());
        assert!(check_cookie("18 1").is_err());
    }

    #[test]
    fn test_traffic_dump_format_and_sentinel() {
        let mut topology = Topology::new("alpha", "fp");
        topology.add_node("bravo", "fp2", None, 655);
        topology.counters_mut("alpha").expect("alpha").socket_in_packets = 10;
        topology.counters_mut("bravo").expect("bravo").socket_in_packets = 20;

        let lines = dump_traffic(&topology);
        assert_eq!(
            lines,
            vec![
                "19 6 alpha 10 0 0 0\n".to_string(),
                "19 6 bravo 20 0 0 0\n".to_string(),
                "19 6\n".to_string(),
            ]
        );
    }

    #[test]
    fn test_subnet_dump_lists_owner_per_prefix() {
        let mut topology = Topology::new("alpha", "fp");
        topology
            .add_subnet("alpha", "10.1.0.0/16".parse().expect("subnet"))
            .expect("claim");
        topology
            .add_subnet("bravo", "10.2.0.0/16".parse().expect("subnet"))
            .expect("claim");

        let lines = dump_subnets(&topology);
        assert_eq!(lines[0], "19 4 10.1.0.0/16 alpha\n");
        assert_eq!(lines[1], "19 4 10.2.0.0/16 bravo\n");
        assert_eq!(lines[2], "19 4\n");
    }

    #[tokio::test]
    async fn test_client_roundtrip_over_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tincd.sock");
        let server = ControlServer::bind(&path).expect("bind");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        tokio::spawn(server.run(events_tx));

        // Fake main loop: answer every DUMP_TRAFFIC with one node and
        // the sentinel.
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                assert_eq!(event.command, ControlCommand::DumpTraffic);
                event.reply.send("19 6 alpha 1 2 3 4\n".to_string()).ok();
                event.reply.send("19 6\n".to_string()).ok();
            }
        });

        let stream = UnixStream::connect(&path).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await.expect("greeting");
        assert!(line.starts_with("19 17 "), "greeting was {line:?}");

        write_half
            .write_all(format!("19 {CONTROL_COOKIE}\n").as_bytes())
            .await
            .expect("cookie");
        write_half.write_all(b"19 6\n").await.expect("request");

        line.clear();
        reader.read_line(&mut line).await.expect("dump line");
        assert_eq!(line, "19 6 alpha 1 2 3 4\n");
        line.clear();
        reader.read_line(&mut line).await.expect("sentinel");
        assert_eq!(line, "19 6\n");
    }

    #[tokio::test]
    async fn test_bad_cookie_disconnects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tincd.sock");
        let server = ControlServer::bind(&path).expect("bind");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        tokio::spawn(server.run(events_tx));

        let stream = UnixStream::connect(&path).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await.expect("greeting");
        write_half.write_all(b"19 4242\n").await.expect("bad cookie");
        write_half.write_all(b"19 6\n").await.expect("request");

        line.clear();
        let n = reader.read_line(&mut line).await.expect("server closed");
        assert_eq!(n, 0, "connection must be closed after cookie mismatch");
        assert!(events_rx.try_recv().is_err(), "no event for refused client");
    }
}
