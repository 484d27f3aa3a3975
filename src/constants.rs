//! Defaults and hard limits used across the resolver.

use std::time::Duration;

/// Default timeout for one DNS TXT exchange (including a TCP retry after truncation).
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time given to a single nameserver before the next one is tried.
pub const DEFAULT_DNS_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound on a whole issuer request, redirects included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Redirect ceiling applied when `max_redirects` is `-1` (unlimited).
///
/// Keeps a redirect loop from spinning until the request timeout fires.
pub const REDIRECT_SAFETY_CEILING: u32 = 50;

/// Default maximum accepted size of the configuration payload.
pub const DEFAULT_PAYLOAD_BUDGET: usize = 1024 * 1024;

/// Initial delay before the first retry.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Default cap for a single retry wait when the configuration does not set one.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Maximum number of consecutive identical failures logged at WARN before
/// being demoted to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Standard DNS port.
pub(crate) const DNS_PORT: u16 = 53;

/// Location of the system resolver configuration.
pub(crate) const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Largest UDP DNS response accepted (EDNS0 advertised payload size).
pub(crate) const MAX_UDP_DNS_PAYLOAD: u16 = 4096;
