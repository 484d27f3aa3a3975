use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::metrics::MetricsErrorKind;
use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::fetch::FetchError;
use crate::jwt::VerificationError;
use crate::trust_store::TrustStoreError;

/// Any failure seen by the bootstrap loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BootstrapError {
    /// Invalid configuration (startup only).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The trust store could not be loaded (startup only).
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),

    /// DNS-TXT discovery failed.
    #[error("discovery failed")]
    Discovery(#[from] DiscoveryError),

    /// No discovery record verified.
    #[error("verification failed")]
    Verification(#[from] VerificationError),

    /// The issuer fetch failed.
    #[error("fetch failed")]
    Fetch(#[from] FetchError),
}

/// Coarse failure classes used in logs, telling operators which remedy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// No route through the selected interface.
    Network,
    /// Signature, certificate or trust material problems.
    Trust,
    /// The remote side rejected the request or answered with something unusable.
    Server,
    /// Timeouts and temporary failures expected to clear on their own.
    Transient,
}

impl FailureCategory {
    /// Stable lowercase label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Trust => "trust",
            Self::Server => "server",
            Self::Transient => "transient",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BootstrapError {
    /// Classifies the failure.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Config(_) => FailureCategory::Server,
            Self::TrustStore(_) | Self::Verification(_) => FailureCategory::Trust,
            Self::Discovery(err) => match err {
                DiscoveryError::NetworkUnreachable(_) | DiscoveryError::NoNameservers => {
                    FailureCategory::Network
                }
                DiscoveryError::NxDomain { .. } | DiscoveryError::MalformedResponse(_) => {
                    FailureCategory::Server
                }
                _ => FailureCategory::Transient,
            },
            Self::Fetch(err) => match err {
                FetchError::NetworkUnreachable(_) => FailureCategory::Network,
                FetchError::TlsConfig { .. }
                | FetchError::TlsHandshakeFailed(_)
                | FetchError::CertificateRejected(_) => FailureCategory::Trust,
                FetchError::Timeout | FetchError::Connect(_) => FailureCategory::Transient,
                FetchError::HttpStatus { status, .. } if *status == 429 || *status >= 500 => {
                    FailureCategory::Transient
                }
                _ => FailureCategory::Server,
            },
        }
    }

    /// Returns `true` if the failure means the selected interface cannot reach the
    /// peer, so the next interface should be tried.
    pub fn is_network_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Discovery(DiscoveryError::NetworkUnreachable(_))
                | Self::Fetch(FetchError::NetworkUnreachable(_))
        )
    }

    /// Delay requested by the issuer through `Retry-After`, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Fetch(FetchError::HttpStatus { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn metrics_kind(&self) -> MetricsErrorKind {
        if self.is_network_unreachable() {
            return MetricsErrorKind::NetworkUnreachable;
        }
        match self {
            Self::Discovery(_) => MetricsErrorKind::Discovery,
            Self::Verification(_) | Self::TrustStore(_) | Self::Config(_) => {
                MetricsErrorKind::Verification
            }
            Self::Fetch(FetchError::HttpStatus { .. }) => MetricsErrorKind::HttpStatus,
            Self::Fetch(FetchError::Timeout) => MetricsErrorKind::FetchTimeout,
            Self::Fetch(
                FetchError::TlsConfig { .. }
                | FetchError::TlsHandshakeFailed(_)
                | FetchError::CertificateRejected(_),
            ) => MetricsErrorKind::Tls,
            Self::Fetch(_) => MetricsErrorKind::Fetch,
        }
    }
}
