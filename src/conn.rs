//! Connection parameters negotiated with the kernel driver.

use crate::ll::flags::InitFlags;

/// Default upper bound for a single write payload, trimmed during INIT
/// if the session buffer is smaller.
pub(crate) const DEFAULT_MAX_WRITE: u32 = 128 * 1024;

/// Default cap on in-flight background requests (readahead etc).
pub(crate) const DEFAULT_MAX_BACKGROUND: u16 = 16;

/// Negotiated connection state.
///
/// Written once while the INIT exchange runs, read-only afterwards.
/// The invariant `want ⊆ capable` holds from the moment INIT completes.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    /// Protocol major version the kernel speaks.
    pub major: u32,
    /// Protocol minor version the kernel speaks.
    pub minor: u32,
    /// Maximum readahead the kernel will issue.
    pub max_readahead: u32,
    /// Capability flags the kernel advertised.
    pub capable: InitFlags,
    /// Capability flags this side enabled.
    pub want: InitFlags,
    /// Largest accepted write payload.
    pub max_write: u32,
    /// Cap on pending background requests.
    pub max_background: u16,
    /// Queue depth at which the kernel considers the connection congested.
    pub congestion_threshold: u16,
    /// Timestamp granularity in nanoseconds.
    pub time_gran: u32,
}

impl Default for ConnInfo {
    fn default() -> Self {
        ConnInfo {
            major: 0,
            minor: 0,
            max_readahead: 0,
            capable: InitFlags::empty(),
            want: InitFlags::empty(),
            max_write: DEFAULT_MAX_WRITE,
            max_background: DEFAULT_MAX_BACKGROUND,
            // The customary threshold is three quarters of max_background.
            congestion_threshold: DEFAULT_MAX_BACKGROUND / 4 * 3,
            time_gran: 1,
        }
    }
}

/// Session configuration, read-only after construction.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Cache TTL in seconds stamped into every ENTRY and ATTR reply.
    pub attr_timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config { attr_timeout: 2.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let conn = ConnInfo::default();
        assert_eq!(conn.max_write, 128 * 1024);
        assert_eq!(conn.max_background, 16);
        assert_eq!(conn.congestion_threshold, 12);
        assert_eq!(conn.time_gran, 1);
        assert!(conn.capable.is_empty());
        assert_eq!(Config::default().attr_timeout, 2.0);
    }
}
