//! Inbound message dispatch.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::actor::inflight::{PingPurpose, RequestPurpose};
use crate::common::{FindValueResult, Id, Message, MessageId, Record, MAX_BUCKET_SIZE_K};

use super::Actor;

impl Actor {
    /// Dispatch one decoded frame from a connected peer.
    ///
    /// Handlers absorb every error locally; nothing a peer sends can halt
    /// the event loop.
    pub(crate) fn handle_message(&mut self, from: Id, message: Message) {
        trace!(%from, ?message, "Received message");

        match message {
            Message::Ping { node_id } => self.handle_ping_request(from, node_id),
            Message::Pong { node_id } => self.handle_pong(from, node_id),
            Message::FindNode { msg_id, target } => self.handle_find_node(from, msg_id, target),
            Message::FindNodeResponse { msg_id, nodes } => {
                self.handle_find_node_response(from, msg_id, nodes)
            }
            Message::Store {
                msg_id,
                key,
                record,
            } => self.handle_store_request(from, msg_id, key, record),
            Message::StoreAck { msg_id } => self.handle_store_ack(from, msg_id),
            Message::FindValue { msg_id, key } => self.handle_find_value(from, msg_id, key),
            Message::FindValueResponse { msg_id, result } => {
                self.handle_find_value_response(from, msg_id, result)
            }
            Message::HasValue { msg_id, key } => self.handle_has_value(from, msg_id, key),
            Message::HasValueResponse { msg_id, has } => {
                self.handle_has_value_response(from, msg_id, has)
            }
        }
    }

    // === Private Methods ===

    /// The node id a peer embeds in PING/PONG must match its transport
    /// identity; an impostor gets dropped.
    fn check_identity(&mut self, from: &Id, claimed: &Id) -> bool {
        if claimed == from {
            return true;
        }

        warn!(%from, %claimed, "Peer id mismatch, dropping peer");
        self.link.drop_peer(from);

        false
    }

    fn handle_ping_request(&mut self, from: Id, node_id: Id) {
        if !self.check_identity(&from, &node_id) {
            return;
        }

        self.add_to_table(from);
        self.reply(
            from,
            Message::Pong {
                node_id: *self.routing_table.id(),
            },
        );
    }

    fn handle_pong(&mut self, from: Id, node_id: Id) {
        if !self.check_identity(&from, &node_id) {
            return;
        }

        self.add_to_table(from);

        for ping in self.pending_pings.complete(&from) {
            match ping.purpose {
                // The head answered: it stays, the newcomer stays parked
                // in the replacement cache.
                PingPurpose::BucketProbe { .. } => {}
                PingPurpose::Liveness { .. } => {}
                PingPurpose::Caller(sender) => {
                    let _ = sender.send(true);
                }
            }
        }
    }

    fn handle_find_node(&mut self, from: Id, msg_id: MessageId, target: Id) {
        // The same request is answered once; retransmits are dropped.
        if self
            .seen_requests
            .insert((from, msg_id), Instant::now())
            .is_some()
        {
            trace!(%from, "Duplicate find-node request");
            return;
        }

        self.add_to_table(from);

        let nodes = self.routing_table.find_closest(&target, MAX_BUCKET_SIZE_K);
        self.reply(from, Message::FindNodeResponse { msg_id, nodes });
    }

    fn handle_find_node_response(&mut self, from: Id, msg_id: MessageId, nodes: Vec<Id>) {
        let Some(request) = self.inflight.complete(&msg_id, &from) else {
            trace!(%from, "Response without a waiter");
            return;
        };

        self.add_to_table(from);

        let RequestPurpose::LookupProbe { target, kind } = request.purpose else {
            debug!(%from, "Response type does not match the request");
            return;
        };

        let self_id = *self.routing_table.id();
        let nodes: Vec<Id> = nodes.into_iter().filter(|id| *id != self_id).collect();

        self.config.hooks.on_find_node_response(&from, &nodes);

        for id in &nodes {
            self.add_to_table(*id);
        }

        if let Some(query) = self.queries.get_mut(&(target, kind)) {
            query.on_nodes(&self_id, nodes);
        }
    }

    fn handle_store_request(&mut self, from: Id, msg_id: MessageId, key: Id, record: Record) {
        self.add_to_table(from);

        if record.data.len() > self.config.max_record_size {
            debug!(%from, size = record.data.len(), "Record exceeds maximum size");
            return;
        }

        // Primary replicas hold the record for the full TTL; nodes
        // outside the key's closest set only keep it as a cache.
        let ttl = if self.is_primary_replica(&key) {
            self.config.store_ttl
        } else {
            self.config.cache_ttl()
        };

        let applied =
            self.storage
                .insert_if_newer(key, record, ttl, false, Instant::now());
        trace!(%from, %key, applied, "Store request");

        // The ack reports receipt; an older-than-held record is received
        // but not adopted, and replicas converge through repair.
        self.reply(from, Message::StoreAck { msg_id });
    }

    fn handle_store_ack(&mut self, from: Id, msg_id: MessageId) {
        let Some(request) = self.inflight.complete(&msg_id, &from) else {
            // Acks for fire-and-forget stores land here.
            return;
        };

        self.add_to_table(from);

        if let RequestPurpose::StoreAck { target } = request.purpose {
            if let Some(store_query) = self.store_queries.get_mut(&target) {
                store_query.on_ack();
            }
        }
    }

    fn handle_find_value(&mut self, from: Id, msg_id: MessageId, key: Id) {
        self.add_to_table(from);

        let result = match self.storage.get(&key, Instant::now()) {
            Some(entry) => FindValueResult::Found(entry.record.clone()),
            None => FindValueResult::Nodes(self.routing_table.find_closest(&key, MAX_BUCKET_SIZE_K)),
        };

        self.reply(from, Message::FindValueResponse { msg_id, result });
    }

    fn handle_find_value_response(&mut self, from: Id, msg_id: MessageId, result: FindValueResult) {
        let Some(request) = self.inflight.complete(&msg_id, &from) else {
            trace!(%from, "Response without a waiter");
            return;
        };

        self.add_to_table(from);

        let RequestPurpose::LookupProbe { target, kind } = request.purpose else {
            debug!(%from, "Response type does not match the request");
            return;
        };

        let self_id = *self.routing_table.id();

        match result {
            FindValueResult::Found(record) => {
                if let Some(query) = self.queries.get_mut(&(target, kind)) {
                    query.on_record(&from, record, self.link.as_mut());
                }
            }
            FindValueResult::Nodes(nodes) => {
                let nodes: Vec<Id> = nodes.into_iter().filter(|id| *id != self_id).collect();

                for id in &nodes {
                    self.add_to_table(*id);
                }

                if let Some(query) = self.queries.get_mut(&(target, kind)) {
                    query.on_nodes(&self_id, nodes);
                }
            }
        }
    }

    fn handle_has_value(&mut self, from: Id, msg_id: MessageId, key: Id) {
        self.add_to_table(from);

        let has = self.storage.contains(&key, Instant::now());
        self.reply(from, Message::HasValueResponse { msg_id, has });
    }

    fn handle_has_value_response(&mut self, from: Id, msg_id: MessageId, has: bool) {
        let Some(request) = self.inflight.complete(&msg_id, &from) else {
            return;
        };

        self.add_to_table(from);

        if has {
            return;
        }

        // The replica lost the record; push it a fresh copy.
        let RequestPurpose::RepairProbe { key } = request.purpose else {
            return;
        };

        let Some(record) = self
            .storage
            .get(&key, Instant::now())
            .map(|entry| entry.record.clone())
        else {
            return;
        };

        debug!(peer = %request.to, %key, "Backfilling replica");

        let message = Message::Store {
            msg_id: MessageId::random(),
            key,
            record,
        };
        self.reply(request.to, message);
    }
}
