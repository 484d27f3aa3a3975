use std::fmt;

/// Structured failure kinds reported to [`MetricsRecorder::record_error`].
///
/// Labels are stable and low-cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MetricsErrorKind {
    /// The selected interface could not reach a nameserver or the issuer.
    NetworkUnreachable,
    /// The TXT lookup failed or timed out.
    Discovery,
    /// No discovery record verified.
    Verification,
    /// TLS handshake or certificate validation failed.
    Tls,
    /// The issuer answered with a non-success status.
    HttpStatus,
    /// The issuer request timed out.
    FetchTimeout,
    /// Any other fetch failure (connection, redirects, payload size).
    Fetch,
}

impl MetricsErrorKind {
    /// Returns a string representation of the error kind.
    ///
    /// This is useful for metrics systems that require string labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkUnreachable => "network_unreachable",
            Self::Discovery => "discovery",
            Self::Verification => "verification",
            Self::Tls => "tls",
            Self::HttpStatus => "http_status",
            Self::FetchTimeout => "fetch_timeout",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for recording bootstrap metrics.
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
///
/// # Example
///
/// ```no_run
/// use device_bootstrap::bootstrap::{MetricsErrorKind, MetricsRecorder};
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_attempt(&self) {}
///     fn record_success(&self) {}
///     fn record_interface_switch(&self) {}
///     fn record_error(&self, kind: MetricsErrorKind) {
///         println!("bootstrap error: {}", kind.as_str());
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records the start of an attempt (entering discovery, or fetch when discovery is
    /// bypassed).
    fn record_attempt(&self);

    /// Records that a payload was obtained.
    fn record_success(&self);

    /// Records a fallback to the next interface after a network-unreachable failure.
    fn record_interface_switch(&self);

    /// Records a failed attempt with a structured error kind.
    fn record_error(&self, kind: MetricsErrorKind);
}
