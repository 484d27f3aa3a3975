//! The bootstrap loop.
//!
//! [`Bootstrapper::run`] drives a small state machine:
//!
//! ```text
//! SelectInterface -> Discover -> Verify -> Fetch -> Done
//!        ^              ^                    |
//!        |              +---- Retrying <-----+  (any stage may fail)
//!        +---------------------/
//! ```
//!
//! A network-unreachable failure moves on to the next interface without waiting. Once
//! every interface has failed that way, the loop backs off and starts over from the
//! cheapest one. Every other failure backs off and retries discovery on the same
//! interface. Retries are unbounded; only cancellation ends the loop without a payload.

mod backoff;
mod error;
mod metrics;

pub use backoff::BackoffConfig;
pub use error::{BootstrapError, FailureCategory};
pub use metrics::{MetricsErrorKind, MetricsRecorder};

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use url::Url;

use self::backoff::{next_backoff, retry_delay, sleep_or_cancel, ErrorTracker};
use crate::config::{Config, ConfigError};
use crate::constants::{DEFAULT_MIN_BACKOFF, MAX_CONSECUTIVE_SAME_ERROR};
use crate::discovery::{DiscoveryClient, StubResolver, TxtResolver};
use crate::fetch::{ConfigFetcher, IssuerFetchClient};
use crate::interface::{DeviceBinder, InterfaceBinder, InterfaceSelector, SelectedInterface};
use crate::jwt::JwtVerifier;
use crate::prelude::{debug, info, warn, warn_or_debug};
use crate::trust_store::TrustStore;

/// Source of the current time, used to check token validity windows.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Why [`Bootstrapper::run`] stopped without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FailureKind {
    /// The cancellation token fired.
    Cancelled,
}

/// Outcome of [`Bootstrapper::run`].
#[derive(Debug)]
pub enum BootstrapResult {
    /// The issuer delivered the configuration payload.
    Success(Bytes),
    /// The loop stopped without a payload.
    Failure {
        /// Why it stopped.
        kind: FailureKind,
        /// The most recent attempt failure, if any attempt failed.
        last_error: Option<BootstrapError>,
    },
}

impl BootstrapResult {
    /// Returns the payload on success.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Success(payload) => Some(payload),
            Self::Failure { .. } => None,
        }
    }

    /// Returns `true` if the run ended with [`FailureKind::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                kind: FailureKind::Cancelled,
                ..
            }
        )
    }
}

#[derive(Debug)]
enum State {
    SelectInterface,
    Discover,
    Verify(Vec<String>),
    Fetch(Url),
    Retrying(BootstrapError),
    Done(Bytes),
}

struct Discovery {
    client: DiscoveryClient,
    verifier: JwtVerifier,
}

/// Resolves the device configuration: discovery, verification and mTLS fetch, with
/// interface fallback and backoff.
///
/// Build one with [`Bootstrapper::builder`].
pub struct Bootstrapper {
    config: Arc<Config>,
    discovery: Option<Discovery>,
    fetcher: Arc<dyn ConfigFetcher>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    clock: Clock,
    backoff: BackoffConfig,
}

impl Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("interfaces", &self.config.behavior.interfaces)
            .field(
                "query_name",
                &self.discovery.as_ref().map(|d| d.client.query_name()),
            )
            .field("fetcher", &"<ConfigFetcher>")
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Bootstrapper {
    /// Starts building a bootstrapper for `config`.
    pub fn builder(config: Arc<Config>) -> BootstrapperBuilder {
        BootstrapperBuilder::new(config)
    }

    /// Runs until a payload is obtained or `token` is cancelled.
    ///
    /// Cancellation drops whatever lookup, handshake or sleep is in flight.
    pub async fn run(&self, token: CancellationToken) -> BootstrapResult {
        let mut selector = InterfaceSelector::new(&self.config.behavior.interfaces);
        let mut iface = SelectedInterface::Default;
        let mut backoff = self.backoff.min_backoff;
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        let mut last_error: Option<BootstrapError> = None;
        let mut state = State::SelectInterface;

        loop {
            if token.is_cancelled() {
                return cancelled(last_error);
            }

            state = match state {
                State::SelectInterface => match selector.next() {
                    Some(next) => {
                        debug!("selected interface {next}");
                        iface = next;
                        State::Discover
                    }
                    None => {
                        selector.reset();
                        State::SelectInterface
                    }
                },

                State::Discover => {
                    if let Some(m) = &self.metrics {
                        m.record_attempt();
                    }
                    match &self.discovery {
                        Some(discovery) => {
                            let Some(result) =
                                or_cancel(&token, discovery.client.discover(&iface)).await
                            else {
                                return cancelled(last_error);
                            };
                            match result {
                                Ok(records) => State::Verify(records),
                                Err(err) => State::Retrying(err.into()),
                            }
                        }
                        None => match &self.config.behavior.issuer.url {
                            Some(url) => State::Fetch(url.clone()),
                            None => State::Retrying(ConfigError::MissingIssuerUrl.into()),
                        },
                    }
                }

                State::Verify(records) => {
                    let verified = self
                        .discovery
                        .as_ref()
                        .ok_or(crate::jwt::VerificationError::NoValidToken)
                        .and_then(|d| d.verifier.verify(&records, (self.clock)()));
                    match verified {
                        Ok(claim) => {
                            debug!(
                                "verified issuer {} (alg={}, kid={:?}, expires {})",
                                claim.issuer_url(),
                                claim.algorithm(),
                                claim.key_id(),
                                claim.expires_at()
                            );
                            State::Fetch(claim.issuer_url().clone())
                        }
                        Err(err) => State::Retrying(err.into()),
                    }
                }

                State::Fetch(url) => {
                    let Some(result) = or_cancel(&token, self.fetcher.fetch(&url, &iface)).await
                    else {
                        return cancelled(last_error);
                    };
                    match result {
                        Ok(payload) => State::Done(payload),
                        Err(err) => State::Retrying(err.into()),
                    }
                }

                State::Retrying(err) => {
                    let category = err.category();
                    let loud = tracker.record_error(category);
                    if let Some(m) = &self.metrics {
                        m.record_error(err.metrics_kind());
                    }

                    let next = if err.is_network_unreachable() && !selector.is_exhausted() {
                        warn_or_debug!(
                            loud,
                            "bootstrap attempt failed: category={category}, interface={iface}, error={}; trying next interface",
                            error_chain(&err)
                        );
                        if let Some(m) = &self.metrics {
                            m.record_interface_switch();
                        }
                        last_error = Some(err);
                        State::SelectInterface
                    } else {
                        let delay =
                            retry_delay(backoff, err.retry_after(), self.backoff.max_backoff);
                        warn_or_debug!(
                            loud,
                            "bootstrap attempt failed: category={category}, interface={iface}, error={}; retrying in {}ms (consecutive={})",
                            error_chain(&err),
                            delay.as_millis(),
                            tracker.consecutive_count()
                        );
                        let resume = if err.is_network_unreachable() {
                            selector.reset();
                            State::SelectInterface
                        } else {
                            State::Discover
                        };
                        last_error = Some(err);

                        if sleep_or_cancel(&token, delay).await {
                            return cancelled(last_error);
                        }
                        // Advance from the wait actually taken so a Retry-After never shortens the next one.
                        backoff = next_backoff(delay, self.backoff.max_backoff);
                        resume
                    };
                    next
                }

                State::Done(payload) => {
                    if tracker.consecutive_count() > 0 {
                        info!(
                            "bootstrap recovered after {} consecutive failure(s)",
                            tracker.consecutive_count()
                        );
                    }
                    info!("configuration obtained via {iface} ({} bytes)", payload.len());
                    if let Some(m) = &self.metrics {
                        m.record_success();
                    }
                    return BootstrapResult::Success(payload);
                }
            };
        }
    }
}

fn cancelled(last_error: Option<BootstrapError>) -> BootstrapResult {
    debug!("cancellation signal received; stopping bootstrap");
    BootstrapResult::Failure {
        kind: FailureKind::Cancelled,
        last_error,
    }
}

async fn or_cancel<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = token.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Renders an error with its sources, `outer: inner: root`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Builder for [`Bootstrapper`].
///
/// Every collaborator has a production default derived from the configuration; tests
/// and embedders can replace any of them.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use device_bootstrap::bootstrap::Bootstrapper;
/// use device_bootstrap::Config;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(Config::from_file("/etc/device/bootstrap.json")?);
/// let bootstrapper = Bootstrapper::builder(config).build()?;
/// let result = bootstrapper.run(CancellationToken::new()).await;
/// if let Some(payload) = result.payload() {
///     println!("got {} bytes", payload.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct BootstrapperBuilder {
    config: Arc<Config>,
    trust_store: Option<Arc<TrustStore>>,
    resolver: Option<Arc<dyn TxtResolver>>,
    fetcher: Option<Arc<dyn ConfigFetcher>>,
    binder: Option<Arc<dyn InterfaceBinder>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    clock: Option<Clock>,
    backoff: Option<BackoffConfig>,
}

impl Debug for BootstrapperBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapperBuilder")
            .field("trust_store", &self.trust_store)
            .field("resolver", &self.resolver.as_ref().map(|_| "<TxtResolver>"))
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<ConfigFetcher>"))
            .field("binder", &self.binder.as_ref().map(|_| "<InterfaceBinder>"))
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .field("clock", &self.clock.as_ref().map(|_| "<Clock>"))
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl BootstrapperBuilder {
    fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            trust_store: None,
            resolver: None,
            fetcher: None,
            binder: None,
            metrics: None,
            clock: None,
            backoff: None,
        }
    }

    /// Uses an already loaded trust store instead of reading `dns_txt.jwt.keys_dir`.
    #[must_use]
    pub fn trust_store(mut self, trust_store: Arc<TrustStore>) -> Self {
        self.trust_store = Some(trust_store);
        self
    }

    /// Sets the TXT resolver (default: [`StubResolver`] bound through the binder).
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn TxtResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the issuer fetcher (default: [`IssuerFetchClient`]).
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn ConfigFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the interface binder used by the default resolver and fetcher
    /// (default: [`DeviceBinder`]).
    #[must_use]
    pub fn binder(mut self, binder: Arc<dyn InterfaceBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    /// Sets an optional metrics recorder.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the clock used for token validity checks (default: system UTC time).
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the retry backoff range (default: 1s up to `behavior.backoff_max`).
    #[must_use]
    pub const fn backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.backoff = Some(BackoffConfig {
            min_backoff,
            max_backoff,
        });
        self
    }

    /// Validates the configuration, loads the trust store if needed and assembles the
    /// bootstrapper.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] for an invalid configuration and
    /// [`BootstrapError::TrustStore`] if the keys cannot be loaded.
    pub fn build(self) -> Result<Bootstrapper, BootstrapError> {
        let config = self.config;
        config.validate()?;
        let behavior = &config.behavior;

        let binder: Arc<dyn InterfaceBinder> =
            self.binder.unwrap_or_else(|| Arc::new(DeviceBinder));

        let discovery = if behavior.dns_txt.enabled() {
            let dns_txt = &behavior.dns_txt;
            let trust = match self.trust_store {
                Some(trust) => trust,
                None => Arc::new(TrustStore::load_from_dir(
                    &dns_txt.jwt.keys_dir,
                    &dns_txt.jwt.algs,
                )?),
            };
            let resolver = self.resolver.unwrap_or_else(|| {
                Arc::new(
                    StubResolver::new(Arc::clone(&binder))
                        .nameservers(dns_txt.nameservers.clone())
                        .ip_family(behavior.force_ip),
                )
            });
            let client =
                DiscoveryClient::new(&config.identity, &dns_txt.base_fqdn, dns_txt.timeout, resolver)?;
            info!("discovery enabled: query name {}", client.query_name());
            let verifier = JwtVerifier::new(Arc::clone(&trust), &dns_txt.jwt.algs);
            for alg in verifier.allowed_algorithms() {
                if !trust.has_algorithm(*alg) {
                    warn!("no trust anchor for allowed algorithm {alg}; its tokens will never verify");
                }
            }
            Some(Discovery { client, verifier })
        } else {
            info!("discovery disabled: using configured issuer url");
            None
        };

        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(IssuerFetchClient::new(&config, Arc::clone(&binder))));

        let backoff = self
            .backoff
            .unwrap_or(BackoffConfig {
                min_backoff: DEFAULT_MIN_BACKOFF,
                max_backoff: behavior.backoff_max,
            })
            .normalize();

        Ok(Bootstrapper {
            clock: self.clock.unwrap_or_else(|| Arc::new(OffsetDateTime::now_utc)),
            config,
            discovery,
            fetcher,
            metrics: self.metrics,
            backoff,
        })
    }
}
