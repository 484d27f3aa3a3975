//! DNS-TXT discovery.
//!
//! The query name is built from the device identity:
//! `<partner_id>.<device_id>.<base_fqdn>`, or `<device_id>.<base_fqdn>` when the partner is
//! empty. The device ID label is the normalized identifier (scheme stripped, lowercase).
//!
//! Answers are returned verbatim, in received order. Nothing in them is trusted; the JWT
//! verifier decides.

mod resolv_conf;
mod stub;

pub use stub::StubResolver;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{validate_dns_name, ConfigError, DeviceIdentity};
use crate::interface::SelectedInterface;
use crate::prelude::debug;

/// Why a TXT lookup produced no answer set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The lookup did not complete in time.
    #[error("dns lookup timed out")]
    Timeout,

    /// The query name does not exist.
    #[error("dns name does not exist: {name}")]
    NxDomain {
        /// Queried name.
        name: String,
    },

    /// No route to any nameserver over the selected interface.
    #[error("network unreachable")]
    NetworkUnreachable(#[source] io::Error),

    /// A response could not be decoded or did not match the query.
    #[error("malformed dns response: {0}")]
    MalformedResponse(String),

    /// Every nameserver answered SERVFAIL or REFUSED.
    #[error("dns server failure ({rcode})")]
    ServerFailure {
        /// Response code reported by the last server.
        rcode: String,
    },

    /// No usable nameserver is configured.
    #[error("no nameservers configured")]
    NoNameservers,

    /// Other socket error.
    #[error("dns i/o error")]
    Io(#[source] io::Error),
}

impl DiscoveryError {
    pub(crate) fn from_io(err: io::Error) -> Self {
        if crate::net::is_unreachable(&err) {
            Self::NetworkUnreachable(err)
        } else if err.kind() == io::ErrorKind::TimedOut {
            Self::Timeout
        } else {
            Self::Io(err)
        }
    }
}

/// Future returned by [`TxtResolver::lookup_txt`].
pub type TxtFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<String>, DiscoveryError>> + Send + 'a>>;

/// Performs TXT lookups over a given interface.
///
/// Each returned string is one TXT record with its character-strings concatenated.
pub trait TxtResolver: Send + Sync + 'static {
    /// Looks up the TXT records of `name`, sending queries through `iface`.
    fn lookup_txt<'a>(&'a self, name: &'a str, iface: &'a SelectedInterface) -> TxtFuture<'a>;
}

/// Builds the discovery query name for `identity` under `base_fqdn`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the device ID cannot be normalized or a label is not a
/// valid DNS label.
pub fn query_name(identity: &DeviceIdentity, base_fqdn: &str) -> Result<String, ConfigError> {
    let base = base_fqdn.strip_suffix('.').unwrap_or(base_fqdn);
    validate_dns_name("dns_txt.base_fqdn", base)?;

    let device = identity.normalized_device_id()?;
    validate_dns_name("identity.device_id", &device)?;

    let name = if identity.partner_id.is_empty() {
        format!("{device}.{base}")
    } else {
        validate_dns_name("identity.partner_id", &identity.partner_id)?;
        format!("{}.{device}.{base}", identity.partner_id.to_ascii_lowercase())
    };

    validate_dns_name("discovery query name", &name)?;
    Ok(name)
}

/// Looks up the discovery records of one device.
#[derive(Clone)]
pub struct DiscoveryClient {
    resolver: Arc<dyn TxtResolver>,
    query_name: String,
    timeout: Duration,
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("resolver", &"<TxtResolver>")
            .field("query_name", &self.query_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DiscoveryClient {
    /// Creates a client for `identity` under `base_fqdn`.
    ///
    /// # Errors
    ///
    /// See [`query_name`].
    pub fn new(
        identity: &DeviceIdentity,
        base_fqdn: &str,
        timeout: Duration,
        resolver: Arc<dyn TxtResolver>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            resolver,
            query_name: query_name(identity, base_fqdn)?,
            timeout,
        })
    }

    /// The name that is queried.
    pub fn query_name(&self) -> &str {
        &self.query_name
    }

    /// Looks up the TXT records through `iface`, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Timeout`] when the timeout elapses, otherwise whatever
    /// the resolver reports.
    pub async fn discover(&self, iface: &SelectedInterface) -> Result<Vec<String>, DiscoveryError> {
        debug!("querying TXT {} via {iface}", self.query_name);
        let records = tokio::time::timeout(
            self.timeout,
            self.resolver.lookup_txt(&self.query_name, iface),
        )
        .await
        .map_err(|_| DiscoveryError::Timeout)??;
        debug!("{} TXT record(s) for {}", records.len(), self.query_name);
        Ok(records)
    }
}
