//! Node configuration.

use std::time::Duration;

use crate::actor::link::{NodeHooks, NoopHooks};
use crate::common::Id;

/// Deadline for FIND_NODE, FIND_VALUE and STORE requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for the liveness probe sent to a bucket head.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for HAS_VALUE existence probes during repair.
pub const DEFAULT_HAS_VALUE_TIMEOUT: Duration = Duration::from_secs(2);
/// Lifetime of a stored record; cached copies live a quarter of this.
pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
/// Node configuration.
///
/// The defaults are the protocol constants; tests shrink the timings.
pub struct Config {
    /// Overrides the node id, which is random by default.
    pub id: Option<Id>,

    /// Deadline for FIND_NODE, FIND_VALUE and STORE requests.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Deadline for PING probes (bucket-full arbitration and liveness).
    ///
    /// Defaults to [DEFAULT_PROBE_TIMEOUT].
    pub probe_timeout: Duration,
    /// Deadline for HAS_VALUE probes during repair.
    ///
    /// Defaults to [DEFAULT_HAS_VALUE_TIMEOUT].
    pub has_value_timeout: Duration,
    /// Pause between a publish lookup finishing and the STOREs going out,
    /// giving freshly-learned peers a chance to connect.
    pub settle_delay: Duration,

    /// How long a record lives after a STORE.
    ///
    /// Defaults to [DEFAULT_STORE_TTL]; lookup caches use a quarter of it.
    pub store_ttl: Duration,
    /// Upper bound on stored records; the least recently used fall out.
    pub max_stored_values: usize,
    /// Upper bound on the value bytes accepted in one record.
    pub max_record_size: usize,

    /// How long a bucket may go unused before it is refreshed with a
    /// lookup for a random id inside it.
    pub refresh_interval: Duration,
    /// How often locally-authored records are re-announced to the
    /// current closest nodes.
    pub republish_interval: Duration,
    /// How often replicas are checked and backfilled at the closest
    /// nodes, and expired records reaped.
    pub repair_interval: Duration,
    /// How often bucket heads are pinged to confirm they are alive.
    pub liveliness_interval: Duration,
    /// How long received request ids are remembered for duplicate
    /// suppression.
    pub seen_cleanup_interval: Duration,

    /// Host callbacks; defaults to no-ops.
    pub hooks: Box<dyn NodeHooks>,
}

impl Config {
    /// Cached records live a quarter of the full TTL.
    pub fn cache_ttl(&self) -> Duration {
        self.store_ttl / 4
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,

            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            has_value_timeout: DEFAULT_HAS_VALUE_TIMEOUT,
            settle_delay: Duration::from_millis(1500),

            store_ttl: DEFAULT_STORE_TTL,
            max_stored_values: 1000,
            max_record_size: 64 * 1024,

            refresh_interval: Duration::from_secs(15 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            repair_interval: Duration::from_secs(10),
            liveliness_interval: Duration::from_secs(5 * 60),
            seen_cleanup_interval: Duration::from_secs(60),

            hooks: Box::new(NoopHooks),
        }
    }
}
