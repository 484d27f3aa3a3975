#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Secure configuration bootstrap for unattended devices.
//!
//! A device that boots with nothing but its identity, a directory of trusted JWT keys
//! and an mTLS client certificate uses this crate to find and download its
//! configuration:
//!
//! 1. look up TXT records at `<partner>.<device>.<base_fqdn>` over the cheapest
//!    configured network interface,
//! 2. accept only a compact JWT signed by a pre-provisioned key with an allowed
//!    algorithm, and read the issuer URL from its `endpoint` claim,
//! 3. fetch the configuration from that URL over mutually authenticated TLS.
//!
//! Failures back off and retry forever, falling back to the next interface when the
//! current one has no route. Only cancellation stops the loop without a payload.
//!
//! ```no_run
//! use std::sync::Arc;
//! use device_bootstrap::{Bootstrapper, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::from_file("/etc/device/bootstrap.json")?);
//! let bootstrapper = Bootstrapper::builder(config).build()?;
//!
//! let token = CancellationToken::new();
//! match bootstrapper.run(token).await.payload() {
//!     Some(payload) => println!("configuration: {} bytes", payload.len()),
//!     None => println!("cancelled"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`** (default): emit diagnostics through the `log` facade
//! - **`tracing`**: emit diagnostics as `tracing` events instead

mod net;
mod observability;
mod prelude;

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod fetch;
pub mod interface;
pub mod jwt;
pub mod trust_store;

pub use bootstrap::{
    BootstrapError, BootstrapResult, Bootstrapper, BootstrapperBuilder, FailureCategory,
    FailureKind, MetricsErrorKind, MetricsRecorder,
};
pub use config::{Config, ConfigError};
pub use discovery::{DiscoveryClient, DiscoveryError, StubResolver, TxtResolver};
pub use fetch::{ConfigFetcher, FetchError, IssuerFetchClient};
pub use interface::{
    DefaultRouteBinder, DeviceBinder, InterfaceBinder, InterfaceSelector, SelectedInterface,
};
pub use jwt::{JwtAlg, JwtVerifier, VerificationError, VerifiedClaim};
pub use trust_store::{TrustAnchor, TrustStore, TrustStoreError};
