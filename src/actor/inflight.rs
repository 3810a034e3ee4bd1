//! Correlation of outgoing requests with their responses.
//!
//! Requests that carry a correlation id live in [InflightRequests];
//! PING/PONG carries none, so pings are tracked per peer in
//! [PendingPings]. Both tables remove an entry before handing it to the
//! caller, so every waiter completes at most once: a response landing
//! after its timeout finds nothing and is dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{Id, MessageId};
use crate::core::iterative_query::LookupKind;

#[derive(Debug, Clone)]
/// Why a correlated request was sent, routing its completion.
pub(crate) enum RequestPurpose {
    /// FIND_NODE or FIND_VALUE probe belonging to the lookup for `target`.
    LookupProbe { target: Id, kind: LookupKind },
    /// STORE awaiting an ack, counted by the publish for `target`.
    StoreAck { target: Id },
    /// HAS_VALUE existence probe for `key` during repair.
    RepairProbe { key: Id },
}

#[derive(Debug)]
pub(crate) struct InflightRequest {
    pub to: Id,
    pub purpose: RequestPurpose,
    pub sent_at: Instant,
    pub timeout: Duration,
}

impl InflightRequest {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) > self.timeout
    }
}

#[derive(Debug, Default)]
/// Outgoing requests still waiting for a response, keyed by message id.
pub(crate) struct InflightRequests {
    requests: HashMap<MessageId, InflightRequest>,
}

impl InflightRequests {
    pub fn register(&mut self, msg_id: MessageId, request: InflightRequest) {
        self.requests.insert(msg_id, request);
    }

    /// Take the request a response settles, if it is still expected and
    /// came from the peer it was sent to.
    pub fn complete(&mut self, msg_id: &MessageId, from: &Id) -> Option<InflightRequest> {
        match self.requests.get(msg_id) {
            Some(request) if request.to == *from => self.requests.remove(msg_id),
            _ => None,
        }
    }

    /// Drain every request whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<InflightRequest> {
        let expired: Vec<MessageId> = self
            .requests
            .iter()
            .filter(|(_, request)| request.is_expired(now))
            .map(|(msg_id, _)| *msg_id)
            .collect();

        expired
            .iter()
            .filter_map(|msg_id| self.requests.remove(msg_id))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[derive(Debug)]
/// Why a PING went out, routing its PONG or timeout.
pub(crate) enum PingPurpose {
    /// Arbitrating a full bucket: the head was probed and `newcomer`
    /// waits in the replacement cache.
    BucketProbe { bucket: u8, newcomer: Id },
    /// Periodic liveness check of a bucket head.
    Liveness { bucket: u8 },
    /// A caller asked whether the peer answers.
    Caller(flume::Sender<bool>),
}

#[derive(Debug)]
pub(crate) struct PendingPing {
    pub purpose: PingPurpose,
    pub sent_at: Instant,
    pub timeout: Duration,
}

impl PendingPing {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) > self.timeout
    }
}

#[derive(Debug, Default)]
/// Outstanding pings keyed by peer id; one PONG settles all of them.
pub(crate) struct PendingPings {
    pings: HashMap<Id, Vec<PendingPing>>,
}

impl PendingPings {
    pub fn register(&mut self, peer: Id, ping: PendingPing) {
        self.pings.entry(peer).or_default().push(ping);
    }

    /// Take every waiter for a peer that answered.
    pub fn complete(&mut self, peer: &Id) -> Vec<PendingPing> {
        self.pings.remove(peer).unwrap_or_default()
    }

    /// Drain every ping whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<(Id, PendingPing)> {
        let mut expired = Vec::new();

        self.pings.retain(|peer, pings| {
            let mut kept = Vec::new();
            for ping in pings.drain(..) {
                if ping.is_expired(now) {
                    expired.push((*peer, ping));
                } else {
                    kept.push(ping);
                }
            }

            *pings = kept;
            !pings.is_empty()
        });

        expired
    }

    /// Whether any ping to this peer is outstanding.
    pub fn is_pending(&self, peer: &Id) -> bool {
        self.pings.contains_key(peer)
    }
}
