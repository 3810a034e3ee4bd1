//! Kademlia routing table: k-buckets with LRU discipline and a FIFO
//! replacement cache per bucket.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::common::{Id, BUCKET_COUNT, ID_LENGTH};

/// K = the maximum size of a k-bucket's live list, its replacement cache,
/// and the fan-out of closest-node replies.
pub const MAX_BUCKET_SIZE_K: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What [RoutingTable::add_or_update] did with an observed id.
pub enum AddOutcome {
    /// New id appended to a bucket with spare capacity.
    Added,
    /// Known id moved to the most-recently-seen end of its bucket.
    Updated,
    /// Bucket is full; the id was parked in the replacement cache.
    /// Carries the bucket index so the caller can probe the bucket head.
    Full(u8),
    /// The id is the local node itself and is never tracked.
    Rejected,
}

#[derive(Debug, Clone)]
/// The local view of the overlay: up to [BUCKET_COUNT] k-buckets indexed
/// by the most significant differing bit from the local id.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] centered on the given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where distances are measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Return the number of live ids in this routing table.
    pub fn size(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.live.len()).sum()
    }

    /// Returns `true` if no bucket holds a live id.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.live.is_empty())
    }

    /// Every live id, bucket by bucket.
    pub fn nodes(&self) -> impl Iterator<Item = &Id> {
        self.buckets.values().flat_map(|bucket| bucket.live.iter())
    }

    /// Snapshot of all non-empty buckets: `(index, live ids)` with the
    /// least-recently-seen id first.
    pub fn dump(&self) -> Vec<(u8, Vec<Id>)> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.live.is_empty())
            .map(|(index, bucket)| (*index, bucket.live.iter().copied().collect()))
            .collect()
    }

    // === Public Methods ===

    /// Record contact with an id.
    ///
    /// A known id moves to the most-recently-seen end of its bucket. A new
    /// id is appended if the bucket has room, and parked in the bucket's
    /// replacement cache otherwise; replacements are FIFO and bounded, the
    /// oldest falling out on overflow.
    pub fn add_or_update(&mut self, id: Id) -> AddOutcome {
        let Some(index) = self.id.bucket_index(&id) else {
            return AddOutcome::Rejected;
        };

        self.buckets.entry(index).or_default().add_or_update(id, index)
    }

    /// Remove an id from its bucket's live list.
    pub fn remove(&mut self, id: &Id) {
        if let Some(index) = self.id.bucket_index(id) {
            if let Some(bucket) = self.buckets.get_mut(&index) {
                bucket.live.retain(|existing| existing != id);
            }
        }
    }

    /// The least-recently-seen live id of a bucket.
    pub fn head_of(&self, index: u8) -> Option<Id> {
        self.buckets
            .get(&index)
            .and_then(|bucket| bucket.live.front().copied())
    }

    /// Drop the least-recently-seen live id of a bucket.
    pub fn evict(&mut self, index: u8) -> Option<Id> {
        self.buckets
            .get_mut(&index)
            .and_then(|bucket| bucket.live.pop_front())
    }

    /// Move the oldest replacement candidate, if any, to the
    /// most-recently-seen end of the bucket's live list.
    pub fn promote_replacement(&mut self, index: u8) -> Option<Id> {
        let bucket = self.buckets.get_mut(&index)?;

        if bucket.live.len() >= MAX_BUCKET_SIZE_K {
            return None;
        }

        let promoted = bucket.replacements.pop_front()?;
        bucket.live.push_back(promoted);

        Some(promoted)
    }

    /// Return up to `count` known ids ordered by XOR distance to the
    /// target, closest first.
    ///
    /// Buckets are visited outward from the target's own bucket,
    /// alternating above and below; every visited non-empty bucket counts
    /// as used for refresh-staleness purposes.
    pub fn find_closest(&mut self, target: &Id, count: usize) -> Vec<Id> {
        let start = self
            .id
            .bucket_index(target)
            .unwrap_or((BUCKET_COUNT - 1) as u8) as i16;

        let now = Instant::now();
        let mut collected = Vec::with_capacity(self.size().min(count * 4));

        for offset in 0..BUCKET_COUNT as i16 {
            for (side, index) in [start + offset, start - offset].into_iter().enumerate() {
                if offset == 0 && side == 1 {
                    continue;
                }
                let Ok(index) = u8::try_from(index) else {
                    continue;
                };

                if let Some(bucket) = self.buckets.get_mut(&index) {
                    if !bucket.live.is_empty() {
                        bucket.last_used = now;
                        collected.extend(bucket.live.iter().copied());
                    }
                }
            }
        }

        collected.sort_by_key(|id| id.xor(target));
        collected.truncate(count);

        collected
    }

    /// Indexes of buckets that have not been used for `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<u8> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| bucket.last_used.elapsed() > max_age)
            .map(|(index, _)| *index)
            .collect()
    }

    /// A random id that falls in the given bucket: the local id with the
    /// bucket's bit flipped and every less significant bit randomized.
    pub fn random_id_in_bucket(&self, index: u8) -> Id {
        let mut bytes = *self.id.as_bytes();
        let byte = index as usize / 8;
        let bit = index as usize % 8;

        bytes[byte] ^= 0x80 >> bit;

        let mut rng = rand::thread_rng();
        let tail_mask = (0x80u16 >> bit) as u8 - 1;
        bytes[byte] ^= rng.gen::<u8>() & tail_mask;
        for b in bytes.iter_mut().skip(byte + 1).take(ID_LENGTH) {
            *b = rng.gen();
        }

        Id(bytes)
    }

    #[cfg(test)]
    fn contains(&self, id: &Id) -> bool {
        self.id
            .bucket_index(id)
            .and_then(|index| self.buckets.get(&index))
            .map(|bucket| bucket.live.contains(id))
            .unwrap_or(false)
    }
}

/// One k-bucket: a bounded live list ordered least-recently-seen first,
/// and a bounded FIFO of replacement candidates disjoint from it.
#[derive(Debug, Clone)]
struct KBucket {
    live: VecDeque<Id>,
    replacements: VecDeque<Id>,
    last_used: Instant,
}

impl KBucket {
    fn add_or_update(&mut self, id: Id, index: u8) -> AddOutcome {
        self.last_used = Instant::now();

        if let Some(pos) = self.live.iter().position(|existing| *existing == id) {
            self.live.remove(pos);
            self.live.push_back(id);

            AddOutcome::Updated
        } else if self.live.len() < MAX_BUCKET_SIZE_K {
            self.live.push_back(id);

            AddOutcome::Added
        } else {
            // Refresh the candidate's position instead of duplicating it.
            if let Some(pos) = self.replacements.iter().position(|existing| *existing == id) {
                self.replacements.remove(pos);
            }
            self.replacements.push_back(id);
            if self.replacements.len() > MAX_BUCKET_SIZE_K {
                self.replacements.pop_front();
            }

            AddOutcome::Full(index)
        }
    }
}

impl Default for KBucket {
    fn default() -> Self {
        KBucket {
            live: VecDeque::with_capacity(MAX_BUCKET_SIZE_K),
            replacements: VecDeque::new(),
            last_used: Instant::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A deterministic id in the given bucket relative to `center`: shares
    /// the first `index` bits, differs at bit `index`, seeded tail.
    fn id_in_bucket(center: &Id, index: u8, seed: u8) -> Id {
        let mut bytes = *center.as_bytes();
        bytes[index as usize / 8] ^= 0x80 >> (index % 8);
        bytes[ID_LENGTH - 1] = bytes[ID_LENGTH - 1].wrapping_add(seed).wrapping_add(1);

        Id(bytes)
    }

    #[test]
    fn added_id_lands_in_its_bucket_index() {
        let mut table = RoutingTable::new(Id::random());

        for _ in 0..64 {
            let id = Id::random();
            let index = table.id().bucket_index(&id).unwrap();

            assert_eq!(table.add_or_update(id), AddOutcome::Added);
            assert_eq!(
                table.buckets.get(&index).map(|b| b.live.contains(&id)),
                Some(true)
            );
        }
    }

    #[test]
    fn self_is_rejected() {
        let id = Id::random();
        let mut table = RoutingTable::new(id);

        assert_eq!(table.add_or_update(id), AddOutcome::Rejected);
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(Id::random());
        let id = Id::random();

        assert_eq!(table.add_or_update(id), AddOutcome::Added);
        assert_eq!(table.add_or_update(id), AddOutcome::Updated);
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn update_moves_to_most_recently_seen_end() {
        let center = Id::random();
        let mut table = RoutingTable::new(center);

        let a = id_in_bucket(&center, 3, 0);
        let b = id_in_bucket(&center, 3, 1);
        let c = id_in_bucket(&center, 3, 2);

        for id in [a, b, c] {
            table.add_or_update(id);
        }
        assert_eq!(table.head_of(3), Some(a));

        // Touching the head makes the next id the least recently seen.
        table.add_or_update(a);
        assert_eq!(table.head_of(3), Some(b));
    }

    #[test]
    fn full_bucket_parks_newcomers_in_replacements() {
        let center = Id::random();
        let mut table = RoutingTable::new(center);

        for seed in 0..MAX_BUCKET_SIZE_K as u8 {
            assert_eq!(
                table.add_or_update(id_in_bucket(&center, 0, seed)),
                AddOutcome::Added
            );
        }

        let newcomer = id_in_bucket(&center, 0, MAX_BUCKET_SIZE_K as u8);
        assert_eq!(table.add_or_update(newcomer), AddOutcome::Full(0));
        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
        assert!(!table.contains(&newcomer));
        assert!(table.buckets[&0].replacements.contains(&newcomer));
    }

    #[test]
    fn replacement_cache_is_bounded_fifo() {
        let center = Id::random();
        let mut table = RoutingTable::new(center);

        for seed in 0..MAX_BUCKET_SIZE_K as u8 {
            table.add_or_update(id_in_bucket(&center, 0, seed));
        }

        let overflow = 5;
        for seed in 0..(MAX_BUCKET_SIZE_K + overflow) as u8 {
            table.add_or_update(id_in_bucket(&center, 0, 100 + seed));
        }

        let bucket = &table.buckets[&0];
        assert_eq!(bucket.replacements.len(), MAX_BUCKET_SIZE_K);
        // The oldest candidates fell out.
        assert_eq!(
            bucket.replacements.front(),
            Some(&id_in_bucket(&center, 0, 100 + overflow as u8))
        );
    }

    #[test]
    fn promotion_refills_live_after_eviction() {
        let center = Id::random();
        let mut table = RoutingTable::new(center);

        for seed in 0..=MAX_BUCKET_SIZE_K as u8 {
            table.add_or_update(id_in_bucket(&center, 0, seed));
        }

        let head = table.head_of(0).unwrap();
        assert_eq!(table.evict(0), Some(head));
        let promoted = table.promote_replacement(0).unwrap();

        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
        assert!(table.contains(&promoted));
        assert!(!table.contains(&head));
    }

    #[test]
    fn promotion_without_replacements_shrinks_live() {
        let center = Id::random();
        let mut table = RoutingTable::new(center);

        for seed in 0..3 {
            table.add_or_update(id_in_bucket(&center, 0, seed));
        }

        table.evict(0);
        assert_eq!(table.promote_replacement(0), None);
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn find_closest_matches_brute_force() {
        let mut table = RoutingTable::new(Id::random());

        let mut ids: Vec<Id> = (0..200).map(|_| Id::random()).collect();
        for id in &ids {
            table.add_or_update(*id);
        }

        for target in [Id::random(), *table.id(), ids[0]] {
            let closest = table.find_closest(&target, MAX_BUCKET_SIZE_K);

            ids.sort_by_key(|id| id.xor(&target));
            let expected: Vec<Id> =
                ids.iter().take(MAX_BUCKET_SIZE_K).copied().collect();

            assert_eq!(closest, expected);
        }
    }

    #[test]
    fn find_closest_orders_ascending_and_truncates() {
        let mut table = RoutingTable::new(Id::random());
        for _ in 0..50 {
            table.add_or_update(Id::random());
        }

        let target = Id::random();
        let closest = table.find_closest(&target, 10);

        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            assert!(pair[0].xor(&target) < pair[1].xor(&target));
        }
    }

    #[test]
    fn find_closest_excludes_self() {
        let mut table = RoutingTable::new(Id::random());
        table.add_or_update(Id::random());

        let target = *table.id();
        let closest = table.find_closest(&target, MAX_BUCKET_SIZE_K);
        assert!(!closest.contains(&target));
    }

    #[test]
    fn random_id_in_bucket_maps_back_to_it() {
        let table = RoutingTable::new(Id::random());

        for index in [0u8, 1, 7, 8, 100, 254, 255] {
            let id = table.random_id_in_bucket(index);

            assert_eq!(table.id().bucket_index(&id), Some(index));
        }
    }

    #[test]
    fn fresh_buckets_are_not_stale() {
        let mut table = RoutingTable::new(Id::random());
        table.add_or_update(Id::random());

        assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
        assert_eq!(table.stale_buckets(Duration::ZERO).len(), 1);
    }
}
