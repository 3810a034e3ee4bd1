//! Iterative lookups: concurrently probing ever closer nodes to a target
//! until no closer ones turn up.
//!
//! A lookup keeps a distance-sorted shortlist of the best candidates seen
//! so far, probes the closest unqueried ones a few at a time, folds the
//! nodes each response returns back into the shortlist, and terminates
//! when the closest known candidate has already been queried. Value
//! lookups additionally merge every record seen and keep going until
//! convergence, so the newest record wins over the first one found.

use std::time::Instant;

use tracing::{debug, trace};

use crate::actor::config::Config;
use crate::actor::inflight::{InflightRequest, InflightRequests, RequestPurpose};
use crate::actor::link::PeerLink;
use crate::common::{Id, Message, MessageId, Record, MAX_BUCKET_SIZE_K};

/// Concurrent probes per lookup.
pub const ALPHA: usize = 3;

/// Simultaneous connection attempts hinted to the transport, across all
/// lookups.
pub const MAX_DIALS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LookupKind {
    FindNode,
    FindValue,
}

#[derive(Debug)]
/// Who gets the result when the lookup terminates.
pub(crate) enum LookupWaiter {
    Nodes(flume::Sender<Vec<Id>>),
    Value(flume::Sender<Option<Record>>),
}

#[derive(Debug)]
struct Candidate {
    id: Id,
    queried: bool,
    /// When a connection attempt was hinted to the transport.
    hinted_at: Option<Instant>,
    /// The hint aged out without a connection; skip this candidate.
    unreachable: bool,
}

impl Candidate {
    fn new(id: Id) -> Self {
        Candidate {
            id,
            queried: false,
            hinted_at: None,
            unreachable: false,
        }
    }

    fn pending(&self) -> bool {
        !self.queried && !self.unreachable
    }
}

#[derive(Debug)]
pub(crate) struct IterativeQuery {
    target: Id,
    kind: LookupKind,
    /// Best candidates seen so far, closest to the target first.
    shortlist: Vec<Candidate>,
    /// The queried id closest to the target; progress is measured
    /// against it.
    closest_queried: Option<Id>,
    inflight: usize,
    best_record: Option<Record>,
    waiters: Vec<LookupWaiter>,
    done: bool,
}

impl IterativeQuery {
    pub fn new(target: Id, kind: LookupKind) -> Self {
        trace!(?target, ?kind, "New lookup");

        Self {
            target,
            kind,
            shortlist: Vec::with_capacity(MAX_BUCKET_SIZE_K * 2),
            closest_queried: None,
            inflight: 0,
            best_record: None,
            waiters: Vec::new(),
            done: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    /// The shortlist ids, closest first.
    pub fn shortlist(&self) -> Vec<Id> {
        self.shortlist.iter().map(|candidate| candidate.id).collect()
    }

    /// The newest record seen, for value lookups.
    pub fn best_record(&self) -> Option<&Record> {
        self.best_record.as_ref()
    }

    // === Public Methods ===

    /// Add a waiter for this lookup's result.
    pub fn add_waiter(&mut self, waiter: LookupWaiter) {
        self.waiters.push(waiter);
    }

    /// Fold ids into the shortlist, excluding the local node and
    /// duplicates, keeping it sorted by distance and bounded.
    pub fn add_candidates(&mut self, self_id: &Id, ids: impl IntoIterator<Item = Id>) {
        for id in ids {
            if id == *self_id || self.shortlist.iter().any(|c| c.id == id) {
                continue;
            }

            self.shortlist.push(Candidate::new(id));
        }

        self.shortlist.sort_by_key(|candidate| candidate.id.xor(&self.target));
        self.shortlist.truncate(MAX_BUCKET_SIZE_K);
    }

    /// A probed node answered with closer nodes.
    pub fn on_nodes(&mut self, self_id: &Id, nodes: Vec<Id>) {
        self.inflight = self.inflight.saturating_sub(1);
        self.add_candidates(self_id, nodes);
    }

    /// A probed node answered with a record.
    ///
    /// The record is merged into the best seen so far, and the first
    /// connected shortlist entry strictly closer to the target than the
    /// responder gets a fire-and-forget copy, spreading popular records
    /// toward their key.
    pub fn on_record(&mut self, from: &Id, record: Record, link: &mut dyn PeerLink) {
        self.inflight = self.inflight.saturating_sub(1);

        if self
            .best_record
            .as_ref()
            .map(|best| record.is_newer_than(best))
            .unwrap_or(true)
        {
            self.best_record = Some(record);
        }

        let Some(best) = self.best_record.clone() else {
            return;
        };

        let responder_distance = from.xor(&self.target);
        let cache_target = self.shortlist.iter().find(|candidate| {
            candidate.id != *from
                && candidate.id.xor(&self.target) < responder_distance
                && link.is_connected(&candidate.id)
        });

        if let Some(candidate) = cache_target {
            let message = Message::Store {
                msg_id: MessageId::random(),
                key: self.target,
                record: best,
            };

            if let Ok(frame) = message.to_bytes() {
                trace!(target = ?self.target, cache = ?candidate.id, "Caching record closer to key");
                link.send(&candidate.id, frame);
            }
        }
    }

    /// A probe timed out.
    pub fn on_timeout(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    /// Advance the lookup: expire stale dial hints, start probes, check
    /// for termination. Returns true once the lookup is done.
    pub fn tick(
        &mut self,
        now: Instant,
        link: &mut dyn PeerLink,
        inflight: &mut InflightRequests,
        dials: &mut DialTracker,
        config: &Config,
    ) -> bool {
        if self.done {
            return true;
        }

        // A hinted candidate that still isn't connected after a request
        // timeout is written off, so the lookup converges even when the
        // transport can't reach parts of the shortlist.
        for candidate in &mut self.shortlist {
            if let Some(hinted_at) = candidate.hinted_at {
                if candidate.pending()
                    && now.duration_since(hinted_at) > config.request_timeout
                    && !link.is_connected(&candidate.id)
                {
                    candidate.unreachable = true;
                }
            }
        }

        self.visit_closest(now, link, inflight, dials, config);

        if self.inflight == 0 && !self.can_progress() {
            self.finish();
            return true;
        }

        false
    }

    // === Private Methods ===

    /// Probe up to [ALPHA] of the closest pending candidates that are
    /// connected; hint dials for those that aren't.
    fn visit_closest(
        &mut self,
        now: Instant,
        link: &mut dyn PeerLink,
        inflight: &mut InflightRequests,
        dials: &mut DialTracker,
        config: &Config,
    ) {
        let mut examined = 0;

        for index in 0..self.shortlist.len() {
            if examined >= ALPHA {
                break;
            }
            if !self.shortlist[index].pending() {
                continue;
            }
            examined += 1;

            let id = self.shortlist[index].id;

            if link.is_connected(&id) {
                if self.inflight < ALPHA {
                    self.probe(index, now, link, inflight, config);
                }
            } else if self.shortlist[index].hinted_at.is_none() && dials.try_hint(link, &id, now) {
                self.shortlist[index].hinted_at = Some(now);
            }
        }
    }

    fn probe(
        &mut self,
        index: usize,
        now: Instant,
        link: &mut dyn PeerLink,
        inflight: &mut InflightRequests,
        config: &Config,
    ) {
        let id = self.shortlist[index].id;
        let msg_id = MessageId::random();

        let message = match self.kind {
            LookupKind::FindNode => Message::FindNode {
                msg_id,
                target: self.target,
            },
            LookupKind::FindValue => Message::FindValue {
                msg_id,
                key: self.target,
            },
        };

        let frame = match message.to_bytes() {
            Ok(frame) => frame,
            Err(error) => {
                debug!(?error, "Could not encode probe");
                return;
            }
        };

        inflight.register(
            msg_id,
            InflightRequest {
                to: id,
                purpose: RequestPurpose::LookupProbe {
                    target: self.target,
                    kind: self.kind,
                },
                sent_at: now,
                timeout: config.request_timeout,
            },
        );
        link.send(&id, frame);

        self.shortlist[index].queried = true;
        self.inflight += 1;

        let is_closer = self
            .closest_queried
            .map(|closest| id.xor(&self.target) < closest.xor(&self.target))
            .unwrap_or(true);
        if is_closer {
            self.closest_queried = Some(id);
        }
    }

    /// Whether further probing can still improve the result: a pending
    /// candidate remains and the best known id is strictly closer than
    /// anything queried so far.
    fn can_progress(&self) -> bool {
        if !self.shortlist.iter().any(|candidate| candidate.pending()) {
            return false;
        }

        match (self.shortlist.first(), self.closest_queried) {
            (Some(best), Some(closest)) => {
                best.id.xor(&self.target) < closest.xor(&self.target)
            }
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn finish(&mut self) {
        self.done = true;

        let shortlist = self.shortlist();
        debug!(
            target = ?self.target,
            kind = ?self.kind,
            shortlist = shortlist.len(),
            found_record = self.best_record.is_some(),
            "Lookup done"
        );

        for waiter in &self.waiters {
            match waiter {
                LookupWaiter::Nodes(sender) => {
                    let _ = sender.send(shortlist.clone());
                }
                LookupWaiter::Value(sender) => {
                    let _ = sender.send(self.best_record.clone());
                }
            }
        }
    }
}

#[derive(Debug, Default)]
/// Rate limiter over connection hints to the transport.
pub(crate) struct DialTracker {
    inflight: std::collections::HashMap<Id, Instant>,
}

impl DialTracker {
    /// Hint a dial if the budget allows. Returns true when the peer is
    /// being dialed, whether by this call or an earlier one.
    pub fn try_hint(&mut self, link: &mut dyn PeerLink, peer: &Id, now: Instant) -> bool {
        if self.inflight.contains_key(peer) {
            return true;
        }
        if self.inflight.len() >= MAX_DIALS {
            return false;
        }

        self.inflight.insert(*peer, now);
        link.connect_hint(peer);

        true
    }

    /// The transport reported this peer connected (or gone); its dial
    /// slot frees up.
    pub fn settled(&mut self, peer: &Id) {
        self.inflight.remove(peer);
    }

    /// Free slots of dials that never completed.
    pub fn prune(&mut self, now: Instant, timeout: std::time::Duration) {
        self.inflight
            .retain(|_, hinted_at| now.duration_since(*hinted_at) <= timeout);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::actor::link::testing::RecordingLink;

    fn setup() -> (RecordingLink, InflightRequests, DialTracker, Config) {
        (
            RecordingLink::default(),
            InflightRequests::default(),
            DialTracker::default(),
            Config::default(),
        )
    }

    fn connected_ids(link: &mut RecordingLink, n: usize) -> Vec<Id> {
        (0..n)
            .map(|_| {
                let id = Id::random();
                link.connect(id);
                id
            })
            .collect()
    }

    #[test]
    fn probes_at_most_alpha_concurrently() {
        let (mut link, mut inflight, mut dials, config) = setup();
        let self_id = Id::random();
        let ids = connected_ids(&mut link, 10);

        let mut query = IterativeQuery::new(Id::random(), LookupKind::FindNode);
        query.add_candidates(&self_id, ids);

        query.tick(Instant::now(), &mut link, &mut inflight, &mut dials, &config);

        assert_eq!(link.sent().len(), ALPHA);
    }

    #[test]
    fn self_never_enters_the_shortlist() {
        let self_id = Id::random();
        let other = Id::random();

        let mut query = IterativeQuery::new(Id::random(), LookupKind::FindNode);
        query.add_candidates(&self_id, [self_id, other, self_id]);

        assert_eq!(query.shortlist(), vec![other]);
    }

    #[test]
    fn shortlist_is_sorted_deduplicated_and_bounded() {
        let self_id = Id::random();
        let target = Id::random();
        let ids: Vec<Id> = (0..40).map(|_| Id::random()).collect();

        let mut query = IterativeQuery::new(target, LookupKind::FindNode);
        query.add_candidates(&self_id, ids.iter().copied());
        query.add_candidates(&self_id, ids.iter().copied());

        let shortlist = query.shortlist();
        assert_eq!(shortlist.len(), MAX_BUCKET_SIZE_K);
        for pair in shortlist.windows(2) {
            assert!(pair[0].xor(&target) < pair[1].xor(&target));
        }
    }

    #[test]
    fn converges_when_no_closer_nodes_turn_up() {
        let (mut link, mut inflight, mut dials, config) = setup();
        let self_id = Id::random();
        let ids = connected_ids(&mut link, 3);

        let mut query = IterativeQuery::new(Id::random(), LookupKind::FindNode);
        let (sender, receiver) = flume::bounded(1);
        query.add_waiter(LookupWaiter::Nodes(sender));
        query.add_candidates(&self_id, ids.clone());

        let now = Instant::now();
        assert!(!query.tick(now, &mut link, &mut inflight, &mut dials, &config));

        // Every probe answers with nothing new.
        for _ in 0..3 {
            query.on_nodes(&self_id, vec![]);
        }

        assert!(query.tick(now, &mut link, &mut inflight, &mut dials, &config));

        let mut expected = ids;
        let target = *query.target();
        expected.sort_by_key(|id| id.xor(&target));
        assert_eq!(receiver.try_recv().unwrap(), expected);
    }

    #[test]
    fn closer_nodes_extend_the_traversal() {
        let (mut link, mut inflight, mut dials, config) = setup();
        let self_id = Id::random();
        let target = Id([0u8; 32]);

        // One far candidate, which will reveal a closer one.
        let mut far = [0u8; 32];
        far[0] = 0x80;
        let far = Id(far);
        let mut near = [0u8; 32];
        near[31] = 1;
        let near = Id(near);

        link.connect(far);
        link.connect(near);

        let mut query = IterativeQuery::new(target, LookupKind::FindNode);
        query.add_candidates(&self_id, [far]);

        let now = Instant::now();
        query.tick(now, &mut link, &mut inflight, &mut dials, &config);
        assert_eq!(link.sent().len(), 1);

        query.on_nodes(&self_id, vec![near]);

        // The closer node gets probed before the lookup can terminate.
        assert!(!query.tick(now, &mut link, &mut inflight, &mut dials, &config));
        assert_eq!(link.sent().len(), 2);
        assert_eq!(link.sent()[1].0, near);

        query.on_nodes(&self_id, vec![]);
        assert!(query.tick(now, &mut link, &mut inflight, &mut dials, &config));
        assert_eq!(query.shortlist()[0], near);
    }

    #[test]
    fn newest_record_wins_after_convergence() {
        let (mut link, mut inflight, mut dials, config) = setup();
        let self_id = Id::random();
        let ids = connected_ids(&mut link, 2);

        let mut query = IterativeQuery::new(Id::random(), LookupKind::FindValue);
        let (sender, receiver) = flume::bounded(1);
        query.add_waiter(LookupWaiter::Value(sender));
        query.add_candidates(&self_id, ids.clone());

        let now = Instant::now();
        query.tick(now, &mut link, &mut inflight, &mut dials, &config);

        let old = Record::new(b"old".to_vec(), 100, Id([0x01; 32]));
        let new = Record::new(b"new".to_vec(), 200, Id([0x02; 32]));

        // The newer record arrives first; the older one must not win.
        query.on_record(&ids[0], new.clone(), &mut link);
        query.on_record(&ids[1], old, &mut link);

        assert!(query.tick(now, &mut link, &mut inflight, &mut dials, &config));
        assert_eq!(receiver.try_recv().unwrap(), Some(new));
    }

    #[test]
    fn record_is_cached_at_the_closest_connected_candidate() {
        let (mut link, mut inflight, mut dials, config) = setup();
        let self_id = Id::random();
        let target = Id([0u8; 32]);

        let mut near = [0u8; 32];
        near[31] = 1;
        let near = Id(near);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        let far = Id(far);

        link.connect(near);
        link.connect(far);

        let mut query = IterativeQuery::new(target, LookupKind::FindValue);
        query.add_candidates(&self_id, [near, far]);
        query.tick(Instant::now(), &mut link, &mut inflight, &mut dials, &config);

        let sent_before = link.sent().len();
        let record = Record::new(b"value".to_vec(), 100, Id([0x01; 32]));
        query.on_record(&far, record.clone(), &mut link);

        // The candidate closer to the key than the responder got a copy.
        let cached = &link.sent_messages()[sent_before..];
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].0, near);
        assert!(matches!(
            &cached[0].1,
            Message::Store { key, record: r, .. } if *key == target && *r == record
        ));
    }

    #[test]
    fn disconnected_candidates_get_dial_hints() {
        let (mut link, mut inflight, mut dials, config) = setup();
        let self_id = Id::random();
        let ids: Vec<Id> = (0..6).map(|_| Id::random()).collect();

        let mut query = IterativeQuery::new(Id::random(), LookupKind::FindNode);
        query.add_candidates(&self_id, ids);

        query.tick(Instant::now(), &mut link, &mut inflight, &mut dials, &config);

        // Hints go to the alpha closest candidates; nothing is probed.
        assert!(link.sent().is_empty());
        assert_eq!(link.hints().len(), ALPHA);
    }

    #[test]
    fn unreachable_candidates_do_not_stall_the_lookup() {
        let (mut link, mut inflight, mut dials, mut config) = setup();
        config.request_timeout = Duration::from_millis(10);
        let self_id = Id::random();

        let mut query = IterativeQuery::new(Id::random(), LookupKind::FindNode);
        let (sender, receiver) = flume::bounded(1);
        query.add_waiter(LookupWaiter::Nodes(sender));
        query.add_candidates(&self_id, [Id::random(), Id::random()]);

        let now = Instant::now();
        assert!(!query.tick(now, &mut link, &mut inflight, &mut dials, &config));

        // Dials aged out without a connection.
        let later = now + Duration::from_millis(20);
        assert!(query.tick(later, &mut link, &mut inflight, &mut dials, &config));
        assert_eq!(receiver.try_recv().unwrap().len(), 2);
    }

    #[test]
    fn dials_are_rate_limited() {
        let mut link = RecordingLink::default();
        let mut dials = DialTracker::default();
        let now = Instant::now();

        for _ in 0..MAX_DIALS {
            assert!(dials.try_hint(&mut link, &Id::random(), now));
        }

        let overflow = Id::random();
        assert!(!dials.try_hint(&mut link, &overflow, now));
        assert_eq!(link.hints().len(), MAX_DIALS);

        // Stale dials free their slots.
        dials.prune(now + Duration::from_secs(6), Duration::from_secs(5));
        assert!(dials.try_hint(&mut link, &overflow, now));
    }
}
