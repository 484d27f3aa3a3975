use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use url::Url;

use super::ConfigError;
use crate::constants::{
    DEFAULT_DNS_TIMEOUT, DEFAULT_MAX_BACKOFF, DEFAULT_PAYLOAD_BUDGET, DEFAULT_REQUEST_TIMEOUT,
    REDIRECT_SAFETY_CEILING,
};
use crate::jwt::JwtAlg;

/// How the device discovers and fetches its configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Behavior {
    /// Keep-alive interval of the downstream connection. Not used by the resolver.
    #[serde(default, deserialize_with = "seconds")]
    pub ping_timeout: Duration,
    /// Upper bound on any single retry wait.
    #[serde(default = "default_backoff_max", deserialize_with = "seconds")]
    pub backoff_max: Duration,
    /// Restricts outbound connections to one IP family.
    #[serde(default)]
    pub force_ip: IpFamily,
    /// Log verbosity requested by the operator. Not used by the resolver.
    #[serde(default)]
    pub verbosity_level: i32,
    /// Interfaces usable for outbound connections. Order does not matter; cost does.
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    /// DNS-TXT discovery settings.
    #[serde(default)]
    pub dns_txt: DnsTxt,
    /// Issuer connection settings.
    pub issuer: IssuerEndpoint,
}

/// A named network interface and its preference weight (lower is preferred).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Interface {
    /// OS interface name, e.g. `eth0`.
    pub name: String,
    /// Preference weight.
    pub cost: u32,
}

impl Interface {
    /// Creates an interface entry.
    pub fn new(name: impl Into<String>, cost: u32) -> Self {
        Self {
            name: name.into(),
            cost,
        }
    }
}

/// Restricts which IP family outbound connections may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum IpFamily {
    /// Either family.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

impl IpFamily {
    /// Returns `true` if `ip` may be used under this restriction.
    pub const fn allows(self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }

    pub(crate) fn filter(self, addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
        addrs
            .into_iter()
            .filter(|addr| self.allows(&addr.ip()))
            .collect()
    }
}

impl TryFrom<i64> for IpFamily {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Any),
            4 => Ok(Self::V4),
            6 => Ok(Self::V6),
            other => Err(ConfigError::InvalidIpFamily(other)),
        }
    }
}

/// DNS-TXT discovery settings.
///
/// Discovery is disabled when `base_fqdn` is empty; the issuer URL is then used directly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DnsTxt {
    /// Domain appended to the device labels to form the query name.
    pub base_fqdn: String,
    /// Verification policy for the records found.
    pub jwt: JwtPolicy,
    /// Timeout for one TXT lookup.
    #[serde(deserialize_with = "seconds")]
    pub timeout: Duration,
    /// Nameservers to query. Empty means read `/etc/resolv.conf`.
    pub nameservers: Vec<SocketAddr>,
}

impl Default for DnsTxt {
    fn default() -> Self {
        Self {
            base_fqdn: String::new(),
            jwt: JwtPolicy::default(),
            timeout: DEFAULT_DNS_TIMEOUT,
            nameservers: Vec::new(),
        }
    }
}

impl DnsTxt {
    /// Returns `true` if a base FQDN is configured.
    pub fn enabled(&self) -> bool {
        !self.base_fqdn.is_empty()
    }
}

/// JWT verification policy for discovery records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JwtPolicy {
    /// Allowed signature algorithms. A token using any other algorithm is rejected.
    pub algs: Vec<JwtAlg>,
    /// Directory holding the verification keys.
    pub keys_dir: PathBuf,
}

/// Static settings for the issuer request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IssuerEndpoint {
    /// Issuer URL used when discovery is disabled.
    #[serde(default)]
    pub url: Option<Url>,
    /// Upper bound on the whole request, redirects included.
    #[serde(default = "default_request_timeout", deserialize_with = "seconds")]
    pub request_timeout: Duration,
    /// Redirect policy.
    #[serde(default)]
    pub max_redirects: RedirectLimit,
    /// Minimum TLS protocol version.
    #[serde(default)]
    pub tls_version: TlsVersion,
    /// PEM bundle of CAs trusted to sign the issuer certificate.
    pub ca_bundle_path: PathBuf,
    /// Client certificate and key presented to the issuer.
    pub mtls: MtlsIdentity,
    /// Largest accepted response body, in bytes.
    #[serde(default = "default_payload_budget")]
    pub payload_budget: usize,
}

/// Paths of the client certificate chain and private key (PEM).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MtlsIdentity {
    /// Certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// Private key (PKCS#8, PKCS#1 or SEC1).
    pub private_key_path: PathBuf,
}

/// How many redirects the issuer client may follow.
///
/// Deserialized from an integer: `-1` is unlimited, `0` is none, `N` is a hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum RedirectLimit {
    /// Follow redirects up to [`REDIRECT_SAFETY_CEILING`].
    Unlimited,
    /// Follow at most this many redirects.
    Limited(u32),
}

impl Default for RedirectLimit {
    fn default() -> Self {
        Self::Limited(10)
    }
}

impl RedirectLimit {
    /// Maximum number of redirects that will actually be followed.
    pub const fn max_follow(self) -> u32 {
        match self {
            Self::Unlimited => REDIRECT_SAFETY_CEILING,
            Self::Limited(n) => n,
        }
    }
}

impl TryFrom<i64> for RedirectLimit {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unlimited),
            n if n >= 0 => u32::try_from(n)
                .map(Self::Limited)
                .map_err(|_| ConfigError::InvalidRedirectLimit(n)),
            n => Err(ConfigError::InvalidRedirectLimit(n)),
        }
    }
}

/// Minimum TLS protocol version for the issuer connection.
///
/// TLS 1.0 and 1.1 are not implemented by the TLS stack; asking for them yields the
/// lowest supported version (1.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TlsVersion {
    /// Highest version available (TLS 1.3).
    #[default]
    #[serde(rename = "max")]
    Max,
    /// TLS 1.0 floor.
    #[serde(rename = "1.0")]
    V1_0,
    /// TLS 1.1 floor.
    #[serde(rename = "1.1")]
    V1_1,
    /// TLS 1.2 floor.
    #[serde(rename = "1.2")]
    V1_2,
    /// TLS 1.3 floor.
    #[serde(rename = "1.3")]
    V1_3,
}

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

const fn default_backoff_max() -> Duration {
    DEFAULT_MAX_BACKOFF
}

const fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

const fn default_payload_budget() -> usize {
    DEFAULT_PAYLOAD_BUDGET
}
