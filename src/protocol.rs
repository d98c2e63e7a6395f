//! Meta-protocol wire format.
//!
//! A meta-line is an ASCII, space-separated tuple terminated by `\n`,
//! at most [`MAX_LINE`] bytes including the terminator. The first token
//! is a decimal request code. The same framing carries the privileged
//! control-channel codeset under the [`Request::Control`] code.

use crate::error::{Error, Result};

/// Maximum meta-line length in bytes, including the trailing newline.
pub const MAX_LINE: usize = 4096;

/// Meta-protocol version advertised in ID. A peer advertising a higher
/// version is incompatible.
pub const PROTOCOL_VERSION: u32 = 17;

/// Cookie the control client presents after the greeting.
pub const CONTROL_COOKIE: u32 = 0x7463_6331;

/// Meta-protocol request codes. The enumeration is stable: codes are
/// wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Request {
    Id = 0,
    MetaKey = 1,
    Challenge = 2,
    ChalReply = 3,
    Ack = 4,
    Status = 5,
    Error = 6,
    TermReq = 7,
    Ping = 8,
    Pong = 9,
    AddNode = 10,
    DelNode = 11,
    AddSubnet = 12,
    DelSubnet = 13,
    AddEdge = 14,
    DelEdge = 15,
    KeyChanged = 16,
    ReqKey = 17,
    AnsKey = 18,
    Control = 19,
}

/// Highest assigned request code.
pub const MAX_REQUEST: u8 = Request::Control as u8;

/// Expected operand count for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    /// Whether `n` operands satisfy this arity.
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(want) => n == want,
            Arity::AtLeast(min) => n >= min,
        }
    }
}

impl Request {
    /// Decode a request code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Id),
            1 => Some(Self::MetaKey),
            2 => Some(Self::Challenge),
            3 => Some(Self::ChalReply),
            4 => Some(Self::Ack),
            5 => Some(Self::Status),
            6 => Some(Self::Error),
            7 => Some(Self::TermReq),
            8 => Some(Self::Ping),
            9 => Some(Self::Pong),
            10 => Some(Self::AddNode),
            11 => Some(Self::DelNode),
            12 => Some(Self::AddSubnet),
            13 => Some(Self::DelSubnet),
            14 => Some(Self::AddEdge),
            15 => Some(Self::DelEdge),
            16 => Some(Self::KeyChanged),
            17 => Some(Self::ReqKey),
            18 => Some(Self::AnsKey),
            19 => Some(Self::Control),
            _ => None,
        }
    }

    /// The wire code.
    pub const fn as_code(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::MetaKey => "METAKEY",
            Self::Challenge => "CHALLENGE",
            Self::ChalReply => "CHAL_REPLY",
            Self::Ack => "ACK",
            Self::Status => "STATUS",
            Self::Error => "ERROR",
            Self::TermReq => "TERMREQ",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::AddNode => "ADD_NODE",
            Self::DelNode => "DEL_NODE",
            Self::AddSubnet => "ADD_SUBNET",
            Self::DelSubnet => "DEL_SUBNET",
            Self::AddEdge => "ADD_EDGE",
            Self::DelEdge => "DEL_EDGE",
            Self::KeyChanged => "KEY_CHANGED",
            Self::ReqKey => "REQ_KEY",
            Self::AnsKey => "ANS_KEY",
            Self::Control => "CONTROL",
        }
    }

    /// Whether this request fans out to all other authenticated
    /// connections when received.
    pub const fn is_broadcast(self) -> bool {
        matches!(
            self,
            Self::AddNode
                | Self::DelNode
                | Self::AddSubnet
                | Self::DelSubnet
                | Self::AddEdge
                | Self::DelEdge
                | Self::KeyChanged
        )
    }

    /// Whether this request is part of the authentication handshake and
    /// therefore legal before the connection is active.
    pub const fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Id | Self::MetaKey | Self::Challenge | Self::ChalReply | Self::Ack
        )
    }

    /// Declared operand count.
    pub const fn arity(self) -> Arity {
        match self {
            Self::Id => Arity::Exact(3),          // name version options
            Self::MetaKey => Arity::Exact(2),     // ephemeral sealed-key
            Self::Challenge => Arity::Exact(1),   // encrypted nonce
            Self::ChalReply => Arity::Exact(1),   // digest
            Self::Ack => Arity::Exact(0),
            Self::Status => Arity::AtLeast(1),
            Self::Error => Arity::AtLeast(1),
            Self::TermReq => Arity::Exact(0),
            Self::Ping => Arity::Exact(0),
            Self::Pong => Arity::Exact(0),
            Self::AddNode => Arity::Exact(4),     // name fingerprint address port
            Self::DelNode => Arity::Exact(1),
            Self::AddSubnet => Arity::Exact(2),   // owner subnet
            Self::DelSubnet => Arity::Exact(2),
            Self::AddEdge => Arity::Exact(4),     // from to weight options
            Self::DelEdge => Arity::Exact(2),
            Self::KeyChanged => Arity::Exact(1),
            Self::ReqKey => Arity::Exact(2),      // from to
            Self::AnsKey => Arity::Exact(3),      // from to key
            Self::Control => Arity::AtLeast(1),
        }
    }
}

/// Control-channel request codes (operand after [`Request::Control`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlRequest {
    Stop = 0,
    Reload = 1,
    DumpNodes = 2,
    DumpEdges = 3,
    DumpSubnets = 4,
    DumpConnections = 5,
    DumpTraffic = 6,
    Purge = 7,
    SetDebug = 8,
    Retry = 9,
}

impl ControlRequest {
    /// Decode a control request code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Stop),
            1 => Some(Self::Reload),
            2 => Some(Self::DumpNodes),
            3 => Some(Self::DumpEdges),
            4 => Some(Self::DumpSubnets),
            5 => Some(Self::DumpConnections),
            6 => Some(Self::DumpTraffic),
            7 => Some(Self::Purge),
            8 => Some(Self::SetDebug),
            9 => Some(Self::Retry),
            _ => None,
        }
    }

    /// The wire code.
    pub const fn as_code(self) -> u8 {
        self as u8
    }
}

/// Reject raw line bytes that violate framing: over-length or embedded
/// NUL.
pub fn check_line_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_LINE {
        return Err(Error::Protocol(format!(
            "Line exceeds {MAX_LINE} bytes ({} received)",
            bytes.len()
        )));
    }
    if bytes.contains(&0) {
        return Err(Error::Protocol("Line contains NUL byte".to_string()));
    }
    Ok(())
}

/// A parsed meta-line: request plus operand tokens.
#[derive(Debug)]
pub struct MetaLine<'a> {
    pub request: Request,
    pub args: Vec<&'a str>,
}

/// Parse one line (without the trailing newline) into request and
/// operands, enforcing the declared arity.
pub fn parse_line(line: &str) -> Result<MetaLine<'_>> {
    let mut tokens = line.split_ascii_whitespace();
    let code_token = tokens
        .next()
        .ok_or_else(|| Error::Protocol("Empty line".to_string()))?;
    let code: u8 = code_token
        .parse()
        .map_err(|_| Error::Protocol(format!("Bad request code '{code_token}'")))?;
    let request = Request::from_code(code)
        .ok_or_else(|| Error::Protocol(format!("Unknown request code {code}")))?;

    let args: Vec<&str> = tokens.collect();
    if !request.arity().accepts(args.len()) {
        return Err(Error::Protocol(format!(
            "{} expects {:?} operands, got {}",
            request.name(),
            request.arity(),
            args.len()
        )));
    }

    Ok(MetaLine { request, args })
}

/// Read one framed line from an async reader, enforcing the length cap
/// and NUL rejection. Returns `None` on a clean EOF; a line that never
/// terminates within [`MAX_LINE`] bytes is a protocol violation.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(Error::Protocol(
            "unterminated or oversized line".to_string(),
        ));
    }
    check_line_bytes(&buf)?;
    buf.pop();
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| Error::Protocol("line is not valid ASCII".to_string()))
}

/// Format a request and operands as one wire line (newline included).
pub fn format_line(request: Request, args: &[&str]) -> String {
    let mut line = request.as_code().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line.push('\n');
    debug_assert!(line.len() <= MAX_LINE, "outbound line exceeds MAX_LINE");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_code_roundtrip() {
        for code in 0..=MAX_REQUEST {
            let request = Request::from_code(code).expect("assigned code");
            assert_eq!(request.as_code(), code);
        }
        assert!(Request::from_code(MAX_REQUEST + 1).is_none());
        assert!(Request::from_code(255).is_none());
    }

    #[test]
    fn test_broadcast_classification() {
        for request in [
            Request::AddNode,
            Request::DelNode,
            Request::AddSubnet,
            Request::DelSubnet,
            Request::AddEdge,
            Request::DelEdge,
            Request::KeyChanged,
        ] {
            assert!(request.is_broadcast(), "{} must rebroadcast", request.name());
        }
        for request in [
            Request::Ping,
            Request::Pong,
            Request::ReqKey,
            Request::AnsKey,
            Request::Status,
            Request::Error,
            Request::TermReq,
        ] {
            assert!(
                !request.is_broadcast(),
                "{} is point-to-point",
                request.name()
            );
        }
    }

    #[test]
    fn test_parse_line_id() {
        let parsed = parse_line("0 alpha 17 0").expect("parse ID");
        assert_eq!(parsed.request, Request::Id);
        assert_eq!(parsed.args, vec!["alpha", "17", "0"]);
    }

    #[test]
    fn test_parse_rejects_bad_code() {
        assert!(parse_line("").is_err());
        assert!(parse_line("abc").is_err());
        assert!(parse_line("250 x").is_err());
        assert!(parse_line("-1 x").is_err());
    }

    #[test]
    fn test_parse_enforces_arity() {
        // PING takes no operands.
        assert!(parse_line("8 extra").is_err());
        // ADD_SUBNET needs owner and subnet.
        assert!(parse_line("12 alpha").is_err());
        assert!(parse_line("12 alpha 10.0.0.0/8").is_ok());
    }

    #[test]
    fn test_check_line_bytes_limits() {
        assert!(check_line_bytes(b"8\n").is_ok());
        assert!(check_line_bytes(&vec![b'a'; MAX_LINE]).is_ok());
        assert!(check_line_bytes(&vec![b'a'; MAX_LINE + 1]).is_err());
        assert!(check_line_bytes(b"8 \0\n").is_err());
    }

    #[test]
    fn test_format_line_shape() {
        assert_eq!(format_line(Request::Ping, &[]), "8\n");
        assert_eq!(
            format_line(Request::AddSubnet, &["alpha", "10.1.0.0/16"]),
            "12 alpha 10.1.0.0/16\n"
        );
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let line = format_line(Request::AddEdge, &["alpha", "bravo", "1", "0"]);
        let parsed = parse_line(line.trim_end()).expect("reparse");
        assert_eq!(parsed.request, Request::AddEdge);
        assert_eq!(parsed.args, vec!["alpha", "bravo", "1", "0"]);
    }
}
