use std::time::Duration;

use crate::wire::RowFormat;

/// Timing and sizing knobs for one [`crate::Retroverse`] instance.
#[derive(Debug, Clone)]
pub struct RetroverseConfig {
    /// How long a long-poll request waits for pushes before returning empty
    pub long_poll_timeout: Duration,
    /// Period of the background refresh loop
    pub background_interval: Duration,
    /// Run session/cache cleanup once every this many background ticks
    pub cleanup_every_ticks: u32,
    /// Sessions idle this long are removed and their locks released
    pub session_idle: Duration,
    /// Unsubscribed cache entries not read for this long are evicted
    pub cache_staleness: Duration,
    /// A lock not touched for this long may be taken over by another session
    pub lock_staleness: Duration,
    /// Unlocked lock-store rows untouched for this long are purged
    pub lock_retention: Duration,
    /// How often the purge runs
    pub lock_purge_interval: Duration,
    /// Look-back overlap when asking the store for peer changes
    pub peer_change_overlap: Duration,
    /// Maximum main rows returned for one page of a query
    pub viewon_page_size: usize,
    /// Row encoding of condensed datons sent to clients
    pub row_format: RowFormat,
}

impl Default for RetroverseConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(30),
            background_interval: Duration::from_secs(2),
            cleanup_every_ticks: 30,
            session_idle: Duration::from_secs(180),
            cache_staleness: Duration::from_secs(20 * 60),
            lock_staleness: Duration::from_secs(120),
            lock_retention: Duration::from_secs(24 * 3600),
            lock_purge_interval: Duration::from_secs(3600),
            peer_change_overlap: Duration::from_secs(1),
            viewon_page_size: 500,
            row_format: RowFormat::Named,
        }
    }
}
