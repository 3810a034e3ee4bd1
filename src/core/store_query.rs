//! Publishing a record to the closest nodes with a write quorum.
//!
//! A publish rides on a node lookup for the key: once the lookup settles
//! on the closest nodes, the query waits briefly so freshly-discovered
//! peers can finish connecting, then sends STOREs and counts acks against
//! the quorum.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::actor::config::Config;
use crate::actor::inflight::{InflightRequest, InflightRequests, RequestPurpose};
use crate::actor::link::PeerLink;
use crate::common::{Id, Message, MessageId, Record, MAX_BUCKET_SIZE_K};

/// Acks required before a publish counts as stored.
pub const WRITE_QUORUM: usize = (MAX_BUCKET_SIZE_K + 1) / 2;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why a publish failed.
pub enum StoreError {
    /// Fewer acks than the write quorum arrived before their deadlines.
    #[error("write quorum not met: {acks} of {needed} acks")]
    QuorumNotMet { acks: usize, needed: usize },

    /// The lookup found no nodes to store at; the routing table is
    /// probably empty.
    #[error("no nodes close to the key to store at")]
    NoClosestNodes,

    /// The value exceeds the configured per-record maximum.
    #[error("record larger than the configured maximum")]
    RecordTooLarge,

    /// Another publish for the same key is still in flight.
    #[error("a publish for this key is already in flight")]
    ConcurrentStore,
}

#[derive(Debug)]
enum Phase {
    /// The node lookup for the key is still traversing.
    AwaitingLookup,
    /// Lookup done; waiting out the settle delay before storing.
    Settling { until: Instant },
    /// STOREs sent; counting acks.
    Storing,
}

#[derive(Debug)]
pub(crate) struct StoreQuery {
    key: Id,
    record: Record,
    phase: Phase,
    targets: Vec<Id>,
    pending: usize,
    acks: usize,
    /// None for republishes, which fire and forget.
    waiter: Option<flume::Sender<Result<usize, StoreError>>>,
    outcome: Option<Result<usize, StoreError>>,
}

impl StoreQuery {
    pub fn new(
        key: Id,
        record: Record,
        waiter: Option<flume::Sender<Result<usize, StoreError>>>,
    ) -> Self {
        Self {
            key,
            record,
            phase: Phase::AwaitingLookup,
            targets: Vec::new(),
            pending: 0,
            acks: 0,
            waiter,
            outcome: None,
        }
    }

    // === Getters ===

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Set once the query finished; `Ok` carries the ack count.
    pub fn outcome(&self) -> Option<&Result<usize, StoreError>> {
        self.outcome.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    // === Public Methods ===

    /// The lookup for the key settled on its closest nodes.
    pub fn lookup_finished(&mut self, closest: Vec<Id>, now: Instant, settle_delay: Duration) {
        self.targets = closest;
        self.phase = Phase::Settling {
            until: now + settle_delay,
        };
    }

    /// An ack arrived from one of the targets.
    pub fn on_ack(&mut self) {
        self.acks += 1;
        self.pending = self.pending.saturating_sub(1);

        if self.acks >= WRITE_QUORUM {
            self.finish(Ok(self.acks));
        }
    }

    /// A STORE timed out without an ack.
    pub fn on_timeout(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Advance the query. Returns true once it is done.
    pub fn tick(
        &mut self,
        now: Instant,
        link: &mut dyn PeerLink,
        inflight: &mut InflightRequests,
        config: &Config,
    ) -> bool {
        if self.is_done() {
            return true;
        }

        match self.phase {
            Phase::AwaitingLookup => {}
            Phase::Settling { until } if now >= until => self.send_stores(now, link, inflight, config),
            Phase::Settling { .. } => {}
            Phase::Storing => {
                if self.pending == 0 {
                    let acks = self.acks;

                    if acks >= WRITE_QUORUM {
                        self.finish(Ok(acks));
                    } else {
                        self.finish(Err(StoreError::QuorumNotMet {
                            acks,
                            needed: WRITE_QUORUM,
                        }));
                    }
                }
            }
        }

        self.is_done()
    }

    // === Private Methods ===

    fn send_stores(
        &mut self,
        now: Instant,
        link: &mut dyn PeerLink,
        inflight: &mut InflightRequests,
        config: &Config,
    ) {
        if self.targets.is_empty() {
            self.finish(Err(StoreError::NoClosestNodes));
            return;
        }

        let fire_and_forget = self.waiter.is_none();
        let mut sent = 0;

        for target in self.targets.clone() {
            if !link.is_connected(&target) {
                continue;
            }

            let msg_id = MessageId::random();
            let message = Message::Store {
                msg_id,
                key: self.key,
                record: self.record.clone(),
            };

            let frame = match message.to_bytes() {
                Ok(frame) => frame,
                Err(error) => {
                    debug!(key = ?self.key, ?error, "Could not encode record");
                    self.finish(Err(StoreError::RecordTooLarge));
                    return;
                }
            };

            if !fire_and_forget {
                inflight.register(
                    msg_id,
                    InflightRequest {
                        to: target,
                        purpose: RequestPurpose::StoreAck { target: self.key },
                        sent_at: now,
                        timeout: config.request_timeout,
                    },
                );
            }

            link.send(&target, frame);
            sent += 1;
        }

        debug!(key = ?self.key, sent, targets = self.targets.len(), "Sent stores");

        self.pending = sent;
        self.phase = Phase::Storing;

        if fire_and_forget {
            self.finish(Ok(sent));
        } else if sent == 0 {
            self.finish(Err(StoreError::QuorumNotMet {
                acks: 0,
                needed: WRITE_QUORUM,
            }));
        }
    }

    fn finish(&mut self, outcome: Result<usize, StoreError>) {
        if self.outcome.is_some() {
            return;
        }

        debug!(key = ?self.key, ?outcome, "Publish done");

        if let Some(waiter) = &self.waiter {
            let _ = waiter.send(outcome.clone());
        }

        self.outcome = Some(outcome);
    }
}
