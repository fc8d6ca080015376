//! # Connection Accounting
//!
//! Tracks when connections were made and answers the interval/quota
//! questions the transport-type decision needs. The decision itself is a
//! pure function of its inputs so every row of the priority/quota table can
//! be tested directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::packet::PacketPriority;
use crate::props::{PropKey, PropertyStore};
use crate::transport::TransportKind;

/// Inputs of the transport-type decision.
#[derive(Debug, Clone, Copy)]
pub struct TransportDecision {
    pub absolute_delay_expired: bool,
    pub min_interval_expired: bool,
    pub max_interval_expired: bool,
    pub under_total_quota: bool,
    pub under_duplex_quota: bool,
    pub supports_simplex: bool,
    pub supports_duplex: bool,
    pub highest_priority: PacketPriority,
}

/// Decide the transport for the next primary-protocol session.
///
/// Priority rules: no events connect only for a max-interval duplex checkup;
/// low priority prefers simplex; normal and high prefer duplex, falling back
/// to simplex only when duplex is unsupported. High priority bypasses the
/// interval timers but never the duplex quota.
pub fn choose_transport(d: &TransportDecision) -> TransportKind {
    if !d.absolute_delay_expired {
        return TransportKind::None;
    }
    match d.highest_priority {
        PacketPriority::None => {
            if d.under_total_quota && d.max_interval_expired && d.under_duplex_quota {
                TransportKind::Duplex
            } else {
                TransportKind::None
            }
        }
        PacketPriority::Low => {
            if !d.under_total_quota || !d.min_interval_expired {
                TransportKind::None
            } else if d.supports_simplex {
                TransportKind::Simplex
            } else if d.under_duplex_quota {
                TransportKind::Duplex
            } else {
                TransportKind::None
            }
        }
        PacketPriority::Normal => {
            if !d.under_total_quota || !d.min_interval_expired {
                TransportKind::None
            } else if d.under_duplex_quota {
                TransportKind::Duplex
            } else if !d.supports_duplex {
                TransportKind::Simplex
            } else {
                TransportKind::None
            }
        }
        PacketPriority::High => {
            if d.under_duplex_quota {
                TransportKind::Duplex
            } else if !d.supports_duplex {
                TransportKind::Simplex
            } else {
                TransportKind::None
            }
        }
    }
}

// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct History {
    connections: VecDeque<(Instant, TransportKind)>,
    last_connection: Option<Instant>,
    last_duplex: Option<Instant>,
}

/// Connection history against the property-store policies.
#[derive(Debug)]
pub struct ConnectionAccounting {
    props: Arc<PropertyStore>,
    history: Mutex<History>,
    supports_simplex: bool,
    supports_duplex: bool,
}

impl ConnectionAccounting {
    pub fn new(props: Arc<PropertyStore>, supports_simplex: bool, supports_duplex: bool) -> Self {
        Self {
            props,
            history: Mutex::new(History::default()),
            supports_simplex,
            supports_duplex,
        }
    }

    pub fn supports_simplex(&self) -> bool {
        self.supports_simplex
    }

    pub fn supports_duplex(&self) -> bool {
        self.supports_duplex
    }

    /// Record a completed connection of the given kind.
    pub fn record_connection(&self, kind: TransportKind) {
        let mut h = self.history.lock();
        let now = Instant::now();
        h.connections.push_back((now, kind));
        h.last_connection = Some(now);
        if kind == TransportKind::Duplex {
            h.last_duplex = Some(now);
        }
        self.prune(&mut h);
    }

    fn window(&self) -> Duration {
        let conn = self.props.get_u32_array(PropKey::CommMaxConnections);
        let minutes = conn.get(2).copied().unwrap_or(60).max(1);
        Duration::from_secs(minutes as u64 * 60)
    }

    fn prune(&self, h: &mut History) {
        let window = self.window();
        let now = Instant::now();
        while let Some(&(t, _)) = h.connections.front() {
            if now.duration_since(t) > window {
                h.connections.pop_front();
            } else {
                break;
            }
        }
    }

    fn quota(&self) -> (u32, u32) {
        let conn = self.props.get_u32_array(PropKey::CommMaxConnections);
        let total = conn.first().copied().unwrap_or(u32::MAX);
        let duplex = conn.get(1).copied().unwrap_or(total);
        (total, duplex)
    }

    pub fn under_total_quota(&self) -> bool {
        let mut h = self.history.lock();
        self.prune(&mut h);
        (h.connections.len() as u32) < self.quota().0
    }

    pub fn under_duplex_quota(&self) -> bool {
        let mut h = self.history.lock();
        self.prune(&mut h);
        let duplex = h
            .connections
            .iter()
            .filter(|(_, k)| *k == TransportKind::Duplex)
            .count() as u32;
        duplex < self.quota().1
    }

    fn elapsed_since_last(&self) -> Option<Duration> {
        self.history
            .lock()
            .last_connection
            .map(|t| Instant::now().duration_since(t))
    }

    /// Absolute minimum delay between any two connections.
    pub fn absolute_delay_expired(&self) -> bool {
        let delay = self.props.get_u32(PropKey::CommMinXmitDelay, 0);
        match self.elapsed_since_last() {
            Some(elapsed) => elapsed >= Duration::from_secs(delay as u64),
            None => true,
        }
    }

    /// Minimum interval between data transmissions.
    pub fn min_interval_expired(&self) -> bool {
        let rate = self.props.get_u32(PropKey::CommMinXmitRate, 0);
        match self.elapsed_since_last() {
            Some(elapsed) => elapsed >= Duration::from_secs(rate as u64),
            None => true,
        }
    }

    /// Maximum quiet interval before a duplex checkup is due.
    pub fn max_interval_expired(&self) -> bool {
        let rate = self.props.get_u32(PropKey::CommMaxXmitRate, 0);
        if rate == 0 {
            return false;
        }
        match self.history.lock().last_duplex {
            Some(t) => Instant::now().duration_since(t) >= Duration::from_secs(rate as u64),
            None => true,
        }
    }

    /// Snapshot the decision inputs for the given queued-event priority.
    pub fn decision(&self, highest_priority: PacketPriority) -> TransportDecision {
        TransportDecision {
            absolute_delay_expired: self.absolute_delay_expired(),
            min_interval_expired: self.min_interval_expired(),
            max_interval_expired: self.max_interval_expired(),
            under_total_quota: self.under_total_quota(),
            under_duplex_quota: self.under_duplex_quota(),
            supports_simplex: self.supports_simplex,
            supports_duplex: self.supports_duplex,
            highest_priority,
        }
    }
}

// ----------------------------------------------------------------------------
