//! Model behind the traffic observer.
//!
//! The observer polls DUMP_TRAFFIC once per refresh and feeds the reply
//! lines into [`TrafficModel`]. Nodes live in a list ordered by name;
//! per-second rates come from counter deltas over the wall-clock
//! interval between dumps, not the requested delay. Nodes absent from
//! the latest dump keep their counters but lose the `known` flag so the
//! chrome can dim them.

use crate::error::{Error, Result};
use crate::protocol::{ControlRequest, Request};
use std::cmp::Ordering;
use std::time::Instant;

/// Per-node statistics tracked by the observer.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub name: String,
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
    pub in_packets_rate: f64,
    pub in_bytes_rate: f64,
    pub out_packets_rate: f64,
    pub out_bytes_rate: f64,
    /// Present in the most recent dump.
    pub known: bool,
}

impl NodeStats {
    /// Whether the node moved packets during the last interval.
    pub fn active(&self) -> bool {
        self.in_packets_rate > 0.0 || self.out_packets_rate > 0.0
    }
}

/// Display orderings. All but `Name` sort descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    #[default]
    Name,
    InPackets,
    InBytes,
    OutPackets,
    OutBytes,
    TotalPackets,
    TotalBytes,
}

impl SortMode {
    /// Column header label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::InPackets => "in pkts",
            Self::InBytes => "in bytes",
            Self::OutPackets => "out pkts",
            Self::OutBytes => "out bytes",
            Self::TotalPackets => "tot pkts",
            Self::TotalBytes => "tot bytes",
        }
    }

    /// Sort mode bound to a key press, if any.
    pub fn for_key(key: char) -> Option<Self> {
        match key {
            'n' => Some(Self::Name),
            'I' => Some(Self::InPackets),
            'i' => Some(Self::InBytes),
            'O' => Some(Self::OutPackets),
            'o' => Some(Self::OutBytes),
            'T' => Some(Self::TotalPackets),
            't' => Some(Self::TotalBytes),
            _ => None,
        }
    }
}

/// Observer-side state across refreshes.
#[derive(Debug, Default)]
pub struct TrafficModel {
    nodes: Vec<NodeStats>,
    pub sortmode: SortMode,
    pub cumulative: bool,
    prev_update: Option<Instant>,
    interval_secs: f64,
}

impl TrafficModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Start consuming a new dump taken at `now`. Marks every node
    /// unknown until the dump names it again.
    pub fn begin_update(&mut self, now: Instant) {
        self.interval_secs = match self.prev_update {
            Some(prev) => now.duration_since(prev).as_secs_f64(),
            None => 0.0,
        };
        self.prev_update = Some(now);
        for node in &mut self.nodes {
            node.known = false;
        }
    }

    /// Consume one reply line. Returns false when the sentinel ends the
    /// dump.
    pub fn apply_line(&mut self, line: &str) -> Result<bool> {
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        let expected_prefix = [
            Request::Control.as_code().to_string(),
            ControlRequest::DumpTraffic.as_code().to_string(),
        ];
        if tokens.len() < 2 || tokens[0] != expected_prefix[0] || tokens[1] != expected_prefix[1] {
            return Err(Error::Protocol(format!("unexpected dump line '{line}'")));
        }
        if tokens.len() == 2 {
            return Ok(false);
        }
        if tokens.len() != 7 {
            return Err(Error::Protocol(format!("malformed traffic line '{line}'")));
        }

        let name = tokens[2];
        let mut values = [0u64; 4];
        for (slot, token) in values.iter_mut().zip(&tokens[3..7]) {
            *slot = token
                .parse()
                .map_err(|_| Error::Protocol(format!("bad counter in '{line}'")))?;
        }
        self.update_node(name, values);
        Ok(true)
    }

    fn update_node(&mut self, name: &str, [in_p, in_b, out_p, out_b]: [u64; 4]) {
        let index = match self.nodes.binary_search_by(|n| n.name.as_str().cmp(name)) {
            Ok(i) => i,
            Err(i) => {
                self.nodes.insert(
                    i,
                    NodeStats {
                        name: name.to_string(),
                        ..NodeStats::default()
                    },
                );
                i
            }
        };

        let node = &mut self.nodes[index];
        if self.interval_secs > 0.0 {
            node.in_packets_rate = delta_rate(in_p, node.in_packets, self.interval_secs);
            node.in_bytes_rate = delta_rate(in_b, node.in_bytes, self.interval_secs);
            node.out_packets_rate = delta_rate(out_p, node.out_packets, self.interval_secs);
            node.out_bytes_rate = delta_rate(out_b, node.out_bytes, self.interval_secs);
        }
        node.in_packets = in_p;
        node.in_bytes = in_b;
        node.out_packets = out_p;
        node.out_bytes = out_b;
        node.known = true;
    }

    /// Nodes in display order for the current sort mode.
    pub fn sorted(&self) -> Vec<&NodeStats> {
        let mut view: Vec<&NodeStats> = self.nodes.iter().collect();
        let cumulative = self.cumulative;
        match self.sortmode {
            SortMode::Name => {} // already ordered by name
            mode => view.sort_by(|a, b| {
                compare(b, a, mode, cumulative).then_with(|| a.name.cmp(&b.name))
            }),
        }
        view
    }
}

fn delta_rate(new: u64, old: u64, interval: f64) -> f64 {
    new.saturating_sub(old) as f64 / interval
}

fn compare(a: &NodeStats, b: &NodeStats, mode: SortMode, cumulative: bool) -> Ordering {
    let key = |n: &NodeStats| -> (u64, f64) {
        match mode {
            SortMode::Name => (0, 0.0),
            SortMode::InPackets => (n.in_packets, n.in_packets_rate),
            SortMode::InBytes => (n.in_bytes, n.in_bytes_rate),
            SortMode::OutPackets => (n.out_packets, n.out_packets_rate),
            SortMode::OutBytes => (n.out_bytes, n.out_bytes_rate),
            SortMode::TotalPackets => (
                n.in_packets + n.out_packets,
                n.in_packets_rate + n.out_packets_rate,
            ),
            SortMode::TotalBytes => (
                n.in_bytes + n.out_bytes,
                n.in_bytes_rate + n.out_bytes_rate,
            ),
        }
    };
    let (a_total, a_rate) = key(a);
    let (b_total, b_rate) = key(b);
    if cumulative {
        a_total.cmp(&b_total)
    } else {
        a_rate.partial_cmp(&b_rate).unwrap_or(Ordering::Equal)
    }
}
