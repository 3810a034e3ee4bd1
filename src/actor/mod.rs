//! The node's event loop.
//!
//! One [Actor] owns every piece of mutable state: the routing table,
//! local storage, inflight requests and running queries. It is advanced
//! by calling [Actor::tick] in a loop on a dedicated thread; commands
//! arrive over a channel and transport events are drained from the peer
//! link, so nothing here needs a lock.

pub(crate) mod config;
pub(crate) mod inflight;
pub(crate) mod link;

mod handle_message;

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, trace};

use crate::common::{
    key_id, now_millis, AddOutcome, Id, Message, MessageId, Record, RoutingTable,
    MAX_BUCKET_SIZE_K,
};
use crate::core::iterative_query::{DialTracker, IterativeQuery, LookupKind, LookupWaiter};
use crate::core::maintenance::Maintenance;
use crate::core::storage::Storage;
use crate::core::store_query::{StoreError, StoreQuery};
use crate::dht::ActorMessage;

use config::Config;
use inflight::{
    InflightRequest, InflightRequests, PendingPing, PendingPings, PingPurpose, RequestPurpose,
};
use link::{LinkEvent, PeerLink};

/// Upper bound on transport events drained per tick, so one busy peer
/// cannot starve timers and maintenance.
const MAX_EVENTS_PER_TICK: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A point-in-time snapshot of the node, for inspection.
pub struct Info {
    /// This node's id.
    pub local_id: Id,
    /// Live ids across all buckets.
    pub routing_table_size: usize,
    /// Non-empty buckets and their live ids, least recently seen first.
    pub buckets: Vec<(u8, Vec<Id>)>,
    /// Peers the transport currently holds a link to.
    pub connected_peers: Vec<Id>,
    /// Records currently held, including cached ones.
    pub stored_values: usize,
}

#[derive(Debug)]
/// The single-threaded engine behind a [Dht](crate::Dht) handle.
pub(crate) struct Actor {
    config: Config,
    link: Box<dyn PeerLink>,

    routing_table: RoutingTable,
    storage: Storage,

    inflight: InflightRequests,
    pending_pings: PendingPings,
    /// Request ids already answered, to suppress duplicate replies.
    seen_requests: HashMap<(Id, MessageId), Instant>,

    queries: HashMap<(Id, LookupKind), IterativeQuery>,
    store_queries: HashMap<Id, StoreQuery>,

    dials: DialTracker,
    maintenance: Maintenance,
}

impl Actor {
    pub fn new(config: Config, link: Box<dyn PeerLink>) -> Self {
        let id = config.id.unwrap_or_else(Id::random);

        info!(local_id = %id, "Starting node");

        Actor {
            routing_table: RoutingTable::new(id),
            storage: Storage::new(config.max_stored_values),

            inflight: InflightRequests::default(),
            pending_pings: PendingPings::default(),
            seen_requests: HashMap::new(),

            queries: HashMap::new(),
            store_queries: HashMap::new(),

            dials: DialTracker::default(),
            maintenance: Maintenance::new(),

            config,
            link,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    pub fn info(&self) -> Info {
        Info {
            local_id: *self.routing_table.id(),
            routing_table_size: self.routing_table.size(),
            buckets: self.routing_table.dump(),
            connected_peers: self.link.connected_peers(),
            stored_values: self.storage.len(),
        }
    }

    /// Whether this node would be among the closest replicas for a key.
    pub fn is_primary_replica(&mut self, key: &Id) -> bool {
        let closest = self.routing_table.find_closest(key, MAX_BUCKET_SIZE_K);

        if closest.len() < MAX_BUCKET_SIZE_K {
            return true;
        }

        let own_distance = self.routing_table.id().xor(key);
        closest
            .last()
            .map(|furthest| own_distance < furthest.xor(key))
            .unwrap_or(true)
    }

    // === Public Methods ===

    /// Drain transport events, expire timers, advance queries and run due
    /// maintenance. Returns true if any event was processed, so the run
    /// loop can sleep when idle.
    pub fn tick(&mut self) -> bool {
        let mut did_work = false;

        for _ in 0..MAX_EVENTS_PER_TICK {
            let Some(event) = self.link.poll_event() else {
                break;
            };

            did_work = true;
            self.handle_event(event);
        }

        let now = Instant::now();

        self.expire_requests(now);
        self.dials.prune(now, self.config.request_timeout);
        self.tick_queries(now);
        self.tick_store_queries(now);
        self.run_maintenance(now);

        did_work
    }

    /// Execute one command from the public handle.
    pub fn handle_command(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Store { key, value, sender } => self.handle_store(key, value, sender),
            ActorMessage::Get { key, sender } => self.handle_get(key, sender),
            ActorMessage::FindClosestNodes { target, sender } => {
                self.lookup(target, LookupKind::FindNode, Some(LookupWaiter::Nodes(sender)));
            }
            ActorMessage::Ping { peer, sender } => self.handle_ping(peer, sender),
            ActorMessage::Info { sender } => {
                let _ = sender.send(self.info());
            }
            ActorMessage::Shutdown => {}
        }
    }

    // === Private Methods ===

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PeerConnected(peer) => {
                trace!(%peer, "Peer connected");

                self.config.hooks.on_peer_connected(&peer);
                self.dials.settled(&peer);
                self.add_to_table(peer);
            }
            LinkEvent::PeerDisconnected(peer) => {
                trace!(%peer, "Peer disconnected");

                // Inflight requests to the peer are left to their timers.
                self.dials.settled(&peer);
                self.routing_table.remove(&peer);
            }
            LinkEvent::Frame(from, frame) => {
                if crate::common::messages::is_signal(&frame) {
                    self.config.hooks.route_signal(&from, &frame);
                    return;
                }

                match Message::from_bytes(&frame) {
                    Ok(message) => self.handle_message(from, message),
                    Err(error) => {
                        debug!(%from, ?error, "Dropping malformed frame");
                    }
                }
            }
        }
    }

    /// Record contact with a peer, arbitrating its bucket when full.
    pub(crate) fn add_to_table(&mut self, peer: Id) {
        if let AddOutcome::Full(bucket) = self.routing_table.add_or_update(peer) {
            self.arbitrate_full_bucket(bucket, peer);
        }
    }

    /// A full bucket saw a newcomer: keep the least-recently-seen head if
    /// it is still alive, otherwise make room. The newcomer waits in the
    /// replacement cache either way.
    fn arbitrate_full_bucket(&mut self, bucket: u8, newcomer: Id) {
        let Some(head) = self.routing_table.head_of(bucket) else {
            return;
        };

        if !self.link.is_connected(&head) {
            debug!(%head, bucket, "Evicting disconnected bucket head");
            self.routing_table.remove(&head);
            self.routing_table.promote_replacement(bucket);
            self.add_to_table(newcomer);
            return;
        }

        // One probe per head at a time; the newcomer's fate rides on it.
        if self.pending_pings.is_pending(&head) {
            return;
        }

        self.send_ping(
            head,
            PingPurpose::BucketProbe { bucket, newcomer },
            self.config.probe_timeout,
        );
    }

    pub(crate) fn send_ping(&mut self, peer: Id, purpose: PingPurpose, timeout: std::time::Duration) {
        let message = Message::Ping {
            node_id: *self.routing_table.id(),
        };

        match message.to_bytes() {
            Ok(frame) => {
                self.link.send(&peer, frame);
                self.pending_pings.register(
                    peer,
                    PendingPing {
                        purpose,
                        sent_at: Instant::now(),
                        timeout,
                    },
                );
            }
            Err(error) => debug!(?error, "Could not encode ping"),
        }
    }

    pub(crate) fn reply(&mut self, to: Id, message: Message) {
        match message.to_bytes() {
            Ok(frame) => self.link.send(&to, frame),
            Err(error) => debug!(%to, ?error, "Could not encode reply"),
        }
    }

    /// Start a lookup, or add a waiter to the one already traversing
    /// toward this target.
    fn lookup(&mut self, target: Id, kind: LookupKind, waiter: Option<LookupWaiter>) {
        if let Some(query) = self.queries.get_mut(&(target, kind)) {
            if let Some(waiter) = waiter {
                query.add_waiter(waiter);
            }
            return;
        }

        let mut query = IterativeQuery::new(target, kind);
        if let Some(waiter) = waiter {
            query.add_waiter(waiter);
        }

        let self_id = *self.routing_table.id();
        let seed = self.routing_table.find_closest(&target, MAX_BUCKET_SIZE_K);
        query.add_candidates(&self_id, seed);

        self.queries.insert((target, kind), query);
    }

    fn handle_store(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        sender: flume::Sender<Result<usize, StoreError>>,
    ) {
        if value.len() > self.config.max_record_size {
            let _ = sender.send(Err(StoreError::RecordTooLarge));
            return;
        }

        let key = key_id(&key);
        if self.store_queries.contains_key(&key) {
            let _ = sender.send(Err(StoreError::ConcurrentStore));
            return;
        }

        let record = Record::new(value, now_millis(), *self.routing_table.id());

        self.store_queries
            .insert(key, StoreQuery::new(key, record, Some(sender)));
        self.lookup(key, LookupKind::FindNode, None);
    }

    fn handle_get(&mut self, key: Vec<u8>, sender: flume::Sender<Option<Record>>) {
        let key = key_id(&key);

        if let Some(entry) = self.storage.get(&key, Instant::now()) {
            let _ = sender.send(Some(entry.record.clone()));
            return;
        }

        self.lookup(key, LookupKind::FindValue, Some(LookupWaiter::Value(sender)));
    }

    fn handle_ping(&mut self, peer: Id, sender: flume::Sender<bool>) {
        if !self.link.is_connected(&peer) {
            let _ = sender.send(false);
            return;
        }

        self.send_ping(peer, PingPurpose::Caller(sender), self.config.probe_timeout);
    }

    fn expire_requests(&mut self, now: Instant) {
        for request in self.inflight.expired(now) {
            match request.purpose {
                RequestPurpose::LookupProbe { target, kind } => {
                    debug!(peer = %request.to, %target, "Lookup probe timed out");

                    self.routing_table.remove(&request.to);
                    if let Some(query) = self.queries.get_mut(&(target, kind)) {
                        query.on_timeout();
                    }
                }
                RequestPurpose::StoreAck { target } => {
                    if let Some(store_query) = self.store_queries.get_mut(&target) {
                        store_query.on_timeout();
                    }
                }
                RequestPurpose::RepairProbe { .. } => {}
            }
        }

        for (peer, ping) in self.pending_pings.expired(now) {
            match ping.purpose {
                PingPurpose::BucketProbe { bucket, newcomer } => {
                    debug!(%peer, bucket, "Bucket head unresponsive, evicting");

                    self.routing_table.remove(&peer);
                    self.routing_table.promote_replacement(bucket);
                    self.add_to_table(newcomer);
                }
                PingPurpose::Liveness { bucket } => {
                    debug!(%peer, bucket, "Bucket head failed liveness check");

                    self.routing_table.remove(&peer);
                    self.routing_table.promote_replacement(bucket);
                    self.link.drop_peer(&peer);
                }
                PingPurpose::Caller(sender) => {
                    let _ = sender.send(false);
                }
            }
        }
    }

    fn tick_queries(&mut self, now: Instant) {
        let keys: Vec<(Id, LookupKind)> = self.queries.keys().copied().collect();
        let mut finished = Vec::new();

        for key in keys {
            let Some(query) = self.queries.get_mut(&key) else {
                continue;
            };

            if query.tick(
                now,
                self.link.as_mut(),
                &mut self.inflight,
                &mut self.dials,
                &self.config,
            ) {
                finished.push(key);
            }
        }

        for key in finished {
            let Some(query) = self.queries.remove(&key) else {
                continue;
            };
            let (target, kind) = key;

            // A found value is cached locally for a fraction of the TTL.
            if kind == LookupKind::FindValue {
                if let Some(record) = query.best_record() {
                    self.storage.insert_if_newer(
                        target,
                        record.clone(),
                        self.config.cache_ttl(),
                        false,
                        now,
                    );
                }
            }

            // A publish waiting on this lookup now knows its targets.
            if let Some(store_query) = self.store_queries.get_mut(&target) {
                store_query.lookup_finished(query.shortlist(), now, self.config.settle_delay);
            }
        }
    }

    fn tick_store_queries(&mut self, now: Instant) {
        let keys: Vec<Id> = self.store_queries.keys().copied().collect();

        for key in keys {
            let Some(store_query) = self.store_queries.get_mut(&key) else {
                continue;
            };

            if store_query.tick(now, self.link.as_mut(), &mut self.inflight, &self.config) {
                let Some(store_query) = self.store_queries.remove(&key) else {
                    continue;
                };

                // A successful publish is also held locally as its
                // author; a republish of the same record extends the
                // author's copy instead.
                if let Some(Ok(_)) = store_query.outcome() {
                    self.storage.insert_if_newer(
                        key,
                        store_query.record().clone(),
                        self.config.store_ttl,
                        true,
                        now,
                    );
                    self.storage
                        .refresh_expiry(&key, self.config.store_ttl, now);
                }
            }
        }
    }

    fn run_maintenance(&mut self, now: Instant) {
        let decisions = self.maintenance.decisions(now, &self.config);

        if decisions.seen_cleanup {
            let horizon = self.config.seen_cleanup_interval;
            self.seen_requests
                .retain(|_, seen_at| now.duration_since(*seen_at) <= horizon);
        }

        if decisions.refresh {
            self.refresh_stale_buckets();
        }
        if decisions.republish {
            self.republish(now);
        }
        if decisions.repair {
            self.repair(now);
        }
        if decisions.liveness {
            self.ping_bucket_heads();
        }
    }

    /// Look up a random id inside every bucket that went unused, keeping
    /// distant parts of the table populated.
    fn refresh_stale_buckets(&mut self) {
        for index in self.routing_table.stale_buckets(self.config.refresh_interval) {
            let target = self.routing_table.random_id_in_bucket(index);

            debug!(bucket = index, %target, "Refreshing stale bucket");
            self.lookup(target, LookupKind::FindNode, None);
        }
    }

    /// Re-announce every record this node authored to the nodes currently
    /// closest to its key.
    fn republish(&mut self, now: Instant) {
        for (key, record) in self.storage.published_entries(now) {
            if self.store_queries.contains_key(&key) {
                continue;
            }

            debug!(%key, "Republishing record");
            self.store_queries
                .insert(key, StoreQuery::new(key, record, None));
            self.lookup(key, LookupKind::FindNode, None);
        }
    }

    /// Probe the closest connected nodes for every published record and
    /// backfill replicas that lost it. Expired records are reaped first.
    fn repair(&mut self, now: Instant) {
        self.storage.reap_expired(now);

        for (key, _) in self
            .storage
            .repair_candidates(now, self.config.repair_interval)
        {
            let targets = self.routing_table.find_closest(&key, MAX_BUCKET_SIZE_K);

            for target in targets {
                if !self.link.is_connected(&target) {
                    continue;
                }

                let msg_id = MessageId::random();
                let message = Message::HasValue { msg_id, key };

                match message.to_bytes() {
                    Ok(frame) => {
                        self.inflight.register(
                            msg_id,
                            InflightRequest {
                                to: target,
                                purpose: RequestPurpose::RepairProbe { key },
                                sent_at: now,
                                timeout: self.config.has_value_timeout,
                            },
                        );
                        self.link.send(&target, frame);
                    }
                    Err(error) => debug!(?error, "Could not encode repair probe"),
                }
            }

            self.storage.mark_repaired(&key, now);
        }
    }

    /// Ping the least-recently-seen member of every bucket; the timeout
    /// path evicts it and asks the transport to drop the link.
    fn ping_bucket_heads(&mut self) {
        for (bucket, ids) in self.routing_table.dump() {
            let Some(head) = ids.first().copied() else {
                continue;
            };

            if self.pending_pings.is_pending(&head) {
                continue;
            }

            self.send_ping(head, PingPurpose::Liveness { bucket }, self.config.probe_timeout);
        }
    }
}
