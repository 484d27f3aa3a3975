//! Device configuration.
//!
//! The configuration is loaded once at startup, validated, and then shared as an
//! immutable `Arc<Config>` by every component. Durations are integer seconds.
//!
//! ```
//! use device_bootstrap::Config;
//!
//! let config = Config::from_json_slice(br#"{
//!     "identity": { "device_id": "mac:112233445566", "partner_id": "acme" },
//!     "behavior": {
//!         "backoff_max": 60,
//!         "interfaces": [ { "name": "eth0", "cost": 1 } ],
//!         "dns_txt": {
//!             "base_fqdn": "fabric.example.com",
//!             "jwt": { "algs": ["ES256"], "keys_dir": "/etc/bootstrap/keys" }
//!         },
//!         "issuer": {
//!             "request_timeout": 20,
//!             "max_redirects": 3,
//!             "tls_version": "1.2",
//!             "ca_bundle_path": "/etc/bootstrap/ca.pem",
//!             "mtls": {
//!                 "cert_path": "/etc/bootstrap/device.pem",
//!                 "private_key_path": "/etc/bootstrap/device.key"
//!             }
//!         }
//!     }
//! }"#)?;
//!
//! assert!(config.behavior.dns_txt.enabled());
//! # Ok::<(), device_bootstrap::ConfigError>(())
//! ```

mod behavior;
mod error;
mod identity;

pub use behavior::{
    Behavior, DnsTxt, Interface, IpFamily, IssuerEndpoint, JwtPolicy, MtlsIdentity,
    RedirectLimit, TlsVersion,
};
pub use error::ConfigError;
pub use identity::{DeviceIdentity, Firmware, Hardware};

pub(crate) use identity::validate_dns_name;

use std::path::Path;

use serde::Deserialize;

/// The full device configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Device identity.
    pub identity: DeviceIdentity,
    /// Hardware descriptors.
    #[serde(default)]
    pub hardware: Hardware,
    /// Firmware descriptors.
    #[serde(default)]
    pub firmware: Firmware,
    /// Discovery and fetch behavior.
    pub behavior: Behavior,
}

impl Config {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the matching
    /// [`ConfigError`] variant if validation fails.
    pub fn from_json_slice(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise see
    /// [`Config::from_json_slice`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_slice(&bytes)
    }

    /// Checks cross-field constraints that the JSON shape alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let behavior = &self.behavior;

        if behavior.backoff_max.is_zero() {
            return Err(ConfigError::InvalidBackoff);
        }
        if behavior.issuer.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("issuer.request_timeout"));
        }
        if behavior.interfaces.iter().any(|i| i.name.is_empty()) {
            return Err(ConfigError::EmptyInterfaceName);
        }

        if let Some(url) = &behavior.issuer.url {
            if url.scheme() != "https" {
                return Err(ConfigError::InsecureIssuerUrl(url.clone()));
            }
        }

        if behavior.dns_txt.enabled() {
            let dns_txt = &behavior.dns_txt;
            validate_dns_name("dns_txt.base_fqdn", &dns_txt.base_fqdn)?;
            validate_dns_name("identity.device_id", &self.identity.normalized_device_id()?)?;
            if !self.identity.partner_id.is_empty() {
                validate_dns_name("identity.partner_id", &self.identity.partner_id)?;
            }
            if dns_txt.jwt.algs.is_empty() {
                return Err(ConfigError::EmptyAlgorithmList);
            }
            if dns_txt.jwt.keys_dir.as_os_str().is_empty() {
                return Err(ConfigError::MissingKeysDir);
            }
            if dns_txt.timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout("dns_txt.timeout"));
            }
        } else if behavior.issuer.url.is_none() {
            return Err(ConfigError::MissingIssuerUrl);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::JwtAlg;
    use std::time::Duration;

    fn json(behavior_extra: &str, dns_txt: &str, issuer_url: &str) -> String {
        format!(
            r#"{{
                "identity": {{ "device_id": "mac:11:22:33:44:55:66", "partner_id": "acme" }},
                "hardware": {{ "model": "X1", "serial_number": "S1", "manufacturer": "M", "last_reboot_reason": "power" }},
                "firmware": {{ "name": "fw-1.0" }},
                "behavior": {{
                    {behavior_extra}
                    "dns_txt": {dns_txt},
                    "issuer": {{
                        {issuer_url}
                        "ca_bundle_path": "/ca.pem",
                        "mtls": {{ "cert_path": "/c.pem", "private_key_path": "/k.pem" }}
                    }}
                }}
            }}"#
        )
    }

    const DISCOVERY: &str =
        r#"{ "base_fqdn": "example.com", "jwt": { "algs": ["ES256", "RS256"], "keys_dir": "/keys" } }"#;

    #[test]
    fn parses_full_document_with_defaults() {
        let config = Config::from_json_slice(json("", DISCOVERY, "").as_bytes()).unwrap();

        assert_eq!(config.hardware.model, "X1");
        assert_eq!(config.firmware.name, "fw-1.0");
        assert_eq!(config.behavior.dns_txt.jwt.algs, vec![JwtAlg::ES256, JwtAlg::RS256]);
        assert_eq!(config.behavior.dns_txt.timeout, crate::constants::DEFAULT_DNS_TIMEOUT);
        assert_eq!(config.behavior.issuer.tls_version, TlsVersion::Max);
        assert_eq!(config.behavior.issuer.max_redirects, RedirectLimit::Limited(10));
        assert_eq!(config.behavior.force_ip, IpFamily::Any);
        assert!(config.behavior.interfaces.is_empty());
    }

    #[test]
    fn parses_behavior_fields() {
        let extra = r#"
            "ping_timeout": 90,
            "backoff_max": 45,
            "force_ip": 6,
            "verbosity_level": 2,
            "interfaces": [ { "name": "wifi", "cost": 10 }, { "name": "eth0", "cost": 1 } ],
        "#;
        let config = Config::from_json_slice(json(extra, DISCOVERY, "").as_bytes()).unwrap();

        assert_eq!(config.behavior.ping_timeout, Duration::from_secs(90));
        assert_eq!(config.behavior.backoff_max, Duration::from_secs(45));
        assert_eq!(config.behavior.force_ip, IpFamily::V6);
        assert_eq!(config.behavior.interfaces[1], Interface::new("eth0", 1));
    }

    #[test]
    fn rejects_empty_algorithm_list_when_discovery_enabled() {
        let dns_txt = r#"{ "base_fqdn": "example.com", "jwt": { "algs": [], "keys_dir": "/keys" } }"#;
        let err = Config::from_json_slice(json("", dns_txt, "").as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAlgorithmList));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let dns_txt = r#"{ "base_fqdn": "example.com", "jwt": { "algs": ["HS256"], "keys_dir": "/k" } }"#;
        let err = Config::from_json_slice(json("", dns_txt, "").as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn bypass_requires_https_issuer_url() {
        let err = Config::from_json_slice(json("", "{}", "").as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingIssuerUrl));

        let http = r#""url": "http://issuer.example.com/config","#;
        let err = Config::from_json_slice(json("", "{}", http).as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::InsecureIssuerUrl(_)));

        let https = r#""url": "https://issuer.example.com/config","#;
        let config = Config::from_json_slice(json("", "{}", https).as_bytes()).unwrap();
        assert!(!config.behavior.dns_txt.enabled());
    }

    #[test]
    fn rejects_bad_numeric_fields() {
        let err =
            Config::from_json_slice(json(r#""force_ip": 5,"#, DISCOVERY, "").as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = Config::from_json_slice(json(r#""backoff_max": 0,"#, DISCOVERY, "").as_bytes())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackoff));

        let err = Config::from_json_slice(
            json(r#""interfaces": [{"name": "eth0", "cost": -1}],"#, DISCOVERY, "").as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_partner_id_that_is_not_a_dns_label() {
        let doc = json("", DISCOVERY, "").replace(r#""partner_id": "acme""#, r#""partner_id": "a b""#);
        let err = Config::from_json_slice(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDnsName { field: "identity.partner_id", .. }));
    }
}
