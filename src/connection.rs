//! Per-peer meta-connection state.
//!
//! One [`Connection`] exists per adjacent meta-peer, owned exclusively
//! by the connection registry. Socket I/O lives in reader/writer tasks;
//! the record here holds the handshake state machine, status flags and
//! the outbound queue handle.

use crate::crypto::{SessionCipher, SessionKey};
use crate::error::{Error, Result};
use crate::protocol::{format_line, Request};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

/// Registry-assigned connection identifier.
pub type ConnId = u64;

/// Handshake state of one meta-connection.
///
/// States only ever move forward, except that any state may fall to
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket not yet established (outgoing attempt in flight).
    Connect,
    /// Outbound socket open, our ID sent.
    IdSent,
    /// Inbound socket accepted, waiting for the peer's ID.
    AwaitId,
    /// ID exchanged, waiting for the peer's METAKEY.
    AwaitMetaKey,
    /// METAKEY exchanged, waiting for the peer's CHALLENGE.
    AwaitChallenge,
    /// CHALLENGE answered, waiting for the peer's CHAL_REPLY.
    AwaitChalReply,
    /// Peer proved key ownership; topology dump sent.
    Authenticated,
    /// ACK received; topology and traffic requests flow.
    Active,
    /// Terminal.
    Closed,
}

impl ConnState {
    /// Progress rank. `IdSent` and `AwaitId` are the two entry branches
    /// of the same step.
    fn rank(self) -> u8 {
        match self {
            Self::Connect => 0,
            Self::IdSent | Self::AwaitId => 1,
            Self::AwaitMetaKey => 2,
            Self::AwaitChallenge => 3,
            Self::AwaitChalReply => 4,
            Self::Authenticated => 5,
            Self::Active => 6,
            Self::Closed => 7,
        }
    }
}

/// One adjacent meta-peer.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    /// Remote name; known after ID, unique within the registry.
    pub name: Option<String>,
    /// Name we dialed (outgoing only); the peer's ID must match.
    pub expected_name: Option<String>,
    /// Remote socket address.
    pub addr: SocketAddr,
    pub state: ConnState,
    /// We initiated this connection (reconnect on failure).
    pub outgoing: bool,
    /// A PING is outstanding.
    pub pinged: bool,
    /// TERMREQ already queued during shutdown.
    pub termreq_sent: bool,
    /// Peer-advertised protocol version.
    pub version: u32,
    /// Peer-advertised option bitset.
    pub options: u32,
    /// Outbound line queue, drained by the writer task.
    outbound: mpsc::UnboundedSender<String>,
    /// Last line received.
    pub last_activity: Instant,
    /// When the socket was established; bounds the handshake.
    pub established_at: Instant,
    /// Session key we generated and sealed to the peer.
    local_key: SessionKey,
    /// Cipher under our session key; the peer's CHALLENGE arrives
    /// encrypted under it.
    local_cipher: SessionCipher,
    /// Cipher under the peer's session key, once their METAKEY arrived.
    peer_cipher: Option<SessionCipher>,
    /// Nonce of the CHALLENGE we sent, awaiting its digest.
    pub sent_challenge: Option<[u8; 32]>,
}

impl Connection {
    /// Create a connection record around an established socket.
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        outgoing: bool,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        let local_key = SessionKey::generate();
        let local_cipher = SessionCipher::new(&local_key);
        let now = Instant::now();
        Self {
            id,
            name: None,
            expected_name: None,
            addr,
            state: if outgoing {
                ConnState::Connect
            } else {
                ConnState::AwaitId
            },
            outgoing,
            pinged: false,
            termreq_sent: false,
            version: 0,
            options: 0,
            outbound,
            last_activity: now,
            established_at: now,
            local_key,
            local_cipher,
            peer_cipher: None,
            sent_challenge: None,
        }
    }

    /// The remote name, or the address when the peer has not identified
    /// itself yet.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.addr.to_string(),
        }
    }

    /// Whether the peer has proved key ownership.
    pub fn authenticated(&self) -> bool {
        matches!(self.state, ConnState::Authenticated | ConnState::Active)
    }

    /// Whether topology and traffic requests flow on this connection.
    pub fn active(&self) -> bool {
        self.state == ConnState::Active
    }

    /// Advance the handshake state machine.
    ///
    /// Regressing transitions are protocol violations; falling to
    /// `Closed` is always allowed.
    pub fn advance(&mut self, to: ConnState) -> Result<()> {
        if to != ConnState::Closed && to.rank() < self.state.rank() {
            return Err(Error::Protocol(format!(
                "connection {} regressed from {:?} to {:?}",
                self.label(),
                self.state,
                to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Queue one request on the outbound buffer.
    pub fn send(&self, request: Request, args: &[&str]) -> Result<()> {
        self.send_raw(&format_line(request, args))
    }

    /// Queue one preformatted wire line (rebroadcast is verbatim).
    pub fn send_raw(&self, line: &str) -> Result<()> {
        self.outbound
            .send(line.to_string())
            .map_err(|_| Error::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    /// Session key we generated for this connection.
    pub fn local_key(&self) -> &SessionKey {
        &self.local_key
    }

    /// Cipher under our own session key.
    pub fn local_cipher(&self) -> &SessionCipher {
        &self.local_cipher
    }

    /// Install the peer's session key decrypted from METAKEY.
    pub fn set_peer_key(&mut self, key: &SessionKey) {
        self.peer_cipher = Some(SessionCipher::new(key));
    }

    /// Cipher under the peer's session key, if negotiated.
    pub fn peer_cipher(&self) -> Option<&SessionCipher> {
        self.peer_cipher.as_ref()
    }

    /// Note inbound traffic for liveness tracking.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.pinged = false;
    }
}
