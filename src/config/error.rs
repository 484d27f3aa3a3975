use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a [`Config`](super::Config).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file {path}")]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON or has the wrong shape.
    #[error("cannot parse configuration")]
    Parse(#[from] serde_json::Error),

    /// The device ID has no recognized `<scheme>:<value>` form.
    #[error("invalid device id '{0}'")]
    InvalidDeviceId(String),

    /// A value that ends up in a DNS name is not a valid DNS label sequence.
    #[error("invalid dns name in '{field}': '{value}'")]
    InvalidDnsName {
        /// Configuration field holding the value.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// Discovery is enabled but the JWT algorithm allow-list is empty.
    #[error("dns_txt.jwt.algs must not be empty when discovery is enabled")]
    EmptyAlgorithmList,

    /// Discovery is enabled but no keys directory was configured.
    #[error("dns_txt.jwt.keys_dir must be set when discovery is enabled")]
    MissingKeysDir,

    /// Discovery is disabled and there is no issuer URL to fall back on.
    #[error("issuer.url must be set when dns_txt.base_fqdn is empty")]
    MissingIssuerUrl,

    /// The issuer URL does not use `https`.
    #[error("issuer url must use https: {0}")]
    InsecureIssuerUrl(url::Url),

    /// `max_redirects` is below `-1`.
    #[error("issuer.max_redirects must be -1, 0 or a positive count (got {0})")]
    InvalidRedirectLimit(i64),

    /// `force_ip` is not one of `0`, `4`, `6`.
    #[error("behavior.force_ip must be 0, 4 or 6 (got {0})")]
    InvalidIpFamily(i64),

    /// `backoff_max` is zero.
    #[error("behavior.backoff_max must be greater than zero")]
    InvalidBackoff,

    /// An interface entry has an empty name.
    #[error("interface names must not be empty")]
    EmptyInterfaceName,

    /// A timeout field is zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}
