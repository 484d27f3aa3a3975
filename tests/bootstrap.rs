mod common;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{Signer, TestResult};
use device_bootstrap::discovery::TxtFuture;
use device_bootstrap::fetch::FetchFuture;
use device_bootstrap::{
    BootstrapError, Bootstrapper, ConfigFetcher, DiscoveryError, FetchError, MetricsErrorKind,
    MetricsRecorder, SelectedInterface, TxtResolver,
};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

type Respond<T> = Box<dyn Fn(usize, &SelectedInterface) -> T + Send + Sync>;

/// Records every call (interface name and virtual time) and answers via a closure.
struct Calls {
    log: Mutex<Vec<(Option<String>, Instant)>>,
}

impl Calls {
    fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, iface: &SelectedInterface) -> usize {
        let mut log = self.log.lock().unwrap();
        log.push((iface.name().map(str::to_owned), Instant::now()));
        log.len()
    }

    fn interfaces(&self) -> Vec<Option<String>> {
        self.log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    fn times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    fn count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

struct MockResolver {
    calls: Calls,
    respond: Respond<Result<Vec<String>, DiscoveryError>>,
}

impl MockResolver {
    fn new(
        respond: impl Fn(usize, &SelectedInterface) -> Result<Vec<String>, DiscoveryError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Calls::new(),
            respond: Box::new(respond),
        })
    }
}

impl TxtResolver for MockResolver {
    fn lookup_txt<'a>(&'a self, _name: &'a str, iface: &'a SelectedInterface) -> TxtFuture<'a> {
        let call = self.calls.record(iface);
        let result = (self.respond)(call, iface);
        Box::pin(std::future::ready(result))
    }
}

/// Resolver whose lookups never complete.
struct StuckResolver;

impl TxtResolver for StuckResolver {
    fn lookup_txt<'a>(&'a self, _name: &'a str, _iface: &'a SelectedInterface) -> TxtFuture<'a> {
        Box::pin(std::future::pending())
    }
}

struct MockFetcher {
    calls: Calls,
    urls: Mutex<Vec<Url>>,
    respond: Respond<Result<Bytes, FetchError>>,
}

impl MockFetcher {
    fn new(
        respond: impl Fn(usize, &SelectedInterface) -> Result<Bytes, FetchError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Calls::new(),
            urls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn serving(payload: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Ok(Bytes::from_static(payload.as_bytes())))
    }
}

impl ConfigFetcher for MockFetcher {
    fn fetch<'a>(&'a self, url: &'a Url, iface: &'a SelectedInterface) -> FetchFuture<'a> {
        self.urls.lock().unwrap().push(url.clone());
        let call = self.calls.record(iface);
        let result = (self.respond)(call, iface);
        Box::pin(std::future::ready(result))
    }
}

#[derive(Default)]
struct CountingMetrics {
    attempts: AtomicUsize,
    successes: AtomicUsize,
    switches: AtomicUsize,
    errors: Mutex<Vec<MetricsErrorKind>>,
}

impl MetricsRecorder for CountingMetrics {
    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn record_interface_switch(&self) {
        self.switches.fetch_add(1, Ordering::SeqCst);
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        self.errors.lock().unwrap().push(kind);
    }
}

fn unreachable() -> io::Error {
    io::Error::new(io::ErrorKind::NetworkUnreachable, "no route to host")
}

fn discovery_config(interfaces: serde_json::Value, backoff_max: u64) -> device_bootstrap::Config {
    common::config(json!({
        "backoff_max": backoff_max,
        "interfaces": interfaces,
        "dns_txt": {
            "base_fqdn": "fabric.example.com",
            "jwt": { "algs": ["ES256"], "keys_dir": "/unused" },
        },
        "issuer": {
            "ca_bundle_path": "/unused/ca.pem",
            "mtls": { "cert_path": "/unused/c.pem", "private_key_path": "/unused/c.key" },
        },
    }))
}

fn direct_config(backoff_max: u64) -> device_bootstrap::Config {
    common::config(json!({
        "backoff_max": backoff_max,
        "issuer": {
            "url": "https://issuer.example.com/direct",
            "ca_bundle_path": "/unused/ca.pem",
            "mtls": { "cert_path": "/unused/c.pem", "private_key_path": "/unused/c.key" },
        },
    }))
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_costlier_interface_when_preferred_is_unreachable() -> TestResult {
    let signer = Signer::generate();
    let token = signer.token("https://issuer.example.com/config");

    let resolver = MockResolver::new(move |_, iface| match iface.name() {
        Some("eth0") => Err(DiscoveryError::NetworkUnreachable(unreachable())),
        _ => Ok(vec![token.clone()]),
    });
    let fetcher = MockFetcher::serving("payload");
    let metrics = Arc::new(CountingMetrics::default());

    let config = discovery_config(
        json!([{ "name": "wifi", "cost": 10 }, { "name": "eth0", "cost": 1 }]),
        60,
    );
    let bootstrapper = Bootstrapper::builder(Arc::new(config))
        .trust_store(signer.store())
        .resolver(resolver.clone())
        .fetcher(fetcher.clone())
        .metrics(metrics.clone())
        .build()?;

    let started = Instant::now();
    let result = bootstrapper.run(CancellationToken::new()).await;

    assert_eq!(result.payload().map(|p| &p[..]), Some(&b"payload"[..]));
    assert_eq!(
        resolver.calls.interfaces(),
        vec![Some("eth0".to_owned()), Some("wifi".to_owned())]
    );
    assert_eq!(fetcher.calls.interfaces(), vec![Some("wifi".to_owned())]);
    assert_eq!(
        fetcher.urls.lock().unwrap()[0].as_str(),
        "https://issuer.example.com/config"
    );
    // Switching interfaces does not wait.
    assert_eq!(started.elapsed(), Duration::ZERO);

    assert_eq!(metrics.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.switches.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.successes.load(Ordering::SeqCst), 1);
    assert_eq!(
        *metrics.errors.lock().unwrap(),
        vec![MetricsErrorKind::NetworkUnreachable]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_interfaces_back_off_and_rewind_to_cheapest() -> TestResult {
    let token = CancellationToken::new();
    let stop = token.clone();
    let resolver = MockResolver::new(move |call, _| {
        if call == 5 {
            stop.cancel();
        }
        Err(DiscoveryError::NetworkUnreachable(unreachable()))
    });

    let config = discovery_config(
        json!([{ "name": "wifi", "cost": 10 }, { "name": "eth0", "cost": 1 }]),
        60,
    );
    let bootstrapper = Bootstrapper::builder(Arc::new(config))
        .trust_store(Signer::generate().store())
        .resolver(resolver.clone())
        .fetcher(MockFetcher::serving("unused"))
        .backoff(Duration::from_secs(2), Duration::from_secs(60))
        .build()?;

    let result = bootstrapper.run(token).await;
    assert!(result.is_cancelled());
    assert!(matches!(
        result,
        device_bootstrap::BootstrapResult::Failure {
            last_error: Some(BootstrapError::Discovery(DiscoveryError::NetworkUnreachable(_))),
            ..
        }
    ));

    let names = resolver.calls.interfaces();
    let expected: Vec<Option<String>> = ["eth0", "wifi", "eth0", "wifi", "eth0"]
        .iter()
        .map(|n| Some((*n).to_owned()))
        .collect();
    assert_eq!(names, expected);

    let times = resolver.calls.times();
    assert_eq!(times[1] - times[0], Duration::ZERO);
    assert!(times[2] - times[1] >= Duration::from_secs(2));
    assert_eq!(times[3] - times[2], Duration::ZERO);
    assert!(times[4] - times[3] >= times[2] - times[1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backoff_is_monotonic_and_capped() -> TestResult {
    let token = CancellationToken::new();
    let stop = token.clone();
    let fetcher = MockFetcher::new(move |call, _| {
        if call == 10 {
            stop.cancel();
        }
        Err(FetchError::HttpStatus {
            status: 503,
            retry_after: None,
        })
    });

    let min = Duration::from_secs(1);
    let max = Duration::from_secs(8);
    let bootstrapper = Bootstrapper::builder(Arc::new(direct_config(8)))
        .fetcher(fetcher.clone())
        .backoff(min, max)
        .build()?;

    let result = bootstrapper.run(token).await;
    assert!(result.is_cancelled());
    assert_eq!(fetcher.calls.count(), 10);

    let times = fetcher.calls.times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    let slack = Duration::from_millis(5);
    assert!(gaps[0] >= min);
    for pair in gaps.windows(2) {
        assert!(pair[1] + slack >= pair[0], "backoff decreased: {gaps:?}");
    }
    for gap in &gaps {
        assert!(*gap <= max + slack, "backoff above cap: {gaps:?}");
    }
    assert!(gaps.last().is_some_and(|g| *g + slack >= max), "{gaps:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_after_is_honoured_up_to_the_cap() -> TestResult {
    let fetcher = MockFetcher::new(|call, _| match call {
        1 => Err(FetchError::HttpStatus {
            status: 429,
            retry_after: Some(Duration::from_secs(30)),
        }),
        2 => Err(FetchError::HttpStatus {
            status: 503,
            retry_after: Some(Duration::from_secs(3600)),
        }),
        _ => Ok(Bytes::from_static(b"ok")),
    });

    let bootstrapper = Bootstrapper::builder(Arc::new(direct_config(60)))
        .fetcher(fetcher.clone())
        .backoff(Duration::from_secs(1), Duration::from_secs(60))
        .build()?;

    let result = bootstrapper.run(CancellationToken::new()).await;
    assert!(result.payload().is_some());

    let times = fetcher.calls.times();
    let slack = Duration::from_millis(5);
    assert!(times[1] - times[0] >= Duration::from_secs(30));
    assert!(times[1] - times[0] <= Duration::from_secs(30) + slack);
    assert!(times[2] - times[1] >= Duration::from_secs(60));
    assert!(times[2] - times[1] <= Duration::from_secs(60) + slack);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn wait_after_retry_after_does_not_shrink() -> TestResult {
    let fetcher = MockFetcher::new(|call, _| match call {
        1 => Err(FetchError::HttpStatus {
            status: 429,
            retry_after: Some(Duration::from_secs(30)),
        }),
        2 => Err(FetchError::HttpStatus {
            status: 503,
            retry_after: None,
        }),
        _ => Ok(Bytes::from_static(b"ok")),
    });

    let bootstrapper = Bootstrapper::builder(Arc::new(direct_config(60)))
        .fetcher(fetcher.clone())
        .backoff(Duration::from_secs(1), Duration::from_secs(60))
        .build()?;

    let result = bootstrapper.run(CancellationToken::new()).await;
    assert!(result.payload().is_some());

    let times = fetcher.calls.times();
    let first = times[1] - times[0];
    let second = times[2] - times[1];
    assert!(first >= Duration::from_secs(30), "{first:?}");
    assert!(second >= first, "wait shrank: {first:?} -> {second:?}");
    assert!(second <= Duration::from_secs(60) + Duration::from_millis(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn trust_failures_retry_on_the_same_interface() -> TestResult {
    let trusted = Signer::generate();
    let rogue = Signer::generate();
    let rogue_token = rogue.token("https://evil.example.com/config");
    let good_token = trusted.token("https://issuer.example.com/config");

    let resolver = MockResolver::new(move |call, _| {
        if call == 1 {
            Ok(vec![rogue_token.clone()])
        } else {
            Ok(vec![good_token.clone()])
        }
    });
    let fetcher = MockFetcher::serving("cfg");
    let metrics = Arc::new(CountingMetrics::default());

    let config = discovery_config(json!([{ "name": "eth0", "cost": 1 }]), 60);
    let bootstrapper = Bootstrapper::builder(Arc::new(config))
        .trust_store(trusted.store())
        .resolver(resolver.clone())
        .fetcher(fetcher.clone())
        .metrics(metrics.clone())
        .build()?;

    let result = bootstrapper.run(CancellationToken::new()).await;
    assert!(result.payload().is_some());
    assert_eq!(
        resolver.calls.interfaces(),
        vec![Some("eth0".to_owned()), Some("eth0".to_owned())]
    );
    assert_eq!(
        fetcher.urls.lock().unwrap().as_slice(),
        &[Url::parse("https://issuer.example.com/config")?]
    );
    assert_eq!(
        *metrics.errors.lock().unwrap(),
        vec![MetricsErrorKind::Verification]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_interfaces_uses_default_route() -> TestResult {
    let fetcher = MockFetcher::serving("cfg");
    let bootstrapper = Bootstrapper::builder(Arc::new(direct_config(60)))
        .fetcher(fetcher.clone())
        .build()?;

    let result = bootstrapper.run(CancellationToken::new()).await;
    assert!(result.payload().is_some());
    assert_eq!(fetcher.calls.interfaces(), vec![None]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discovery_is_bypassed_without_base_fqdn() -> TestResult {
    let resolver = MockResolver::new(|_, _| panic!("discovery must not run"));
    let fetcher = MockFetcher::serving("cfg");

    let bootstrapper = Bootstrapper::builder(Arc::new(direct_config(60)))
        .resolver(resolver.clone())
        .fetcher(fetcher.clone())
        .build()?;

    let result = bootstrapper.run(CancellationToken::new()).await;
    assert!(result.payload().is_some());
    assert_eq!(resolver.calls.count(), 0);
    assert_eq!(
        fetcher.urls.lock().unwrap()[0].as_str(),
        "https://issuer.example.com/direct"
    );
    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_pending_discovery() -> TestResult {
    let config = discovery_config(json!([]), 60);
    let bootstrapper = Bootstrapper::builder(Arc::new(config))
        .trust_store(Signer::generate().store())
        .resolver(Arc::new(StuckResolver))
        .fetcher(MockFetcher::serving("unused"))
        .build()?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), bootstrapper.run(token)).await?;
    match result {
        device_bootstrap::BootstrapResult::Failure { kind, last_error } => {
            assert_eq!(kind, device_bootstrap::FailureKind::Cancelled);
            assert!(last_error.is_none());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn invalid_configuration_is_rejected_at_build() {
    let mut config = direct_config(60);
    config.behavior.issuer.url = None;

    let err = Bootstrapper::builder(Arc::new(config)).build().unwrap_err();
    assert!(matches!(err, BootstrapError::Config(_)), "{err:?}");
}
