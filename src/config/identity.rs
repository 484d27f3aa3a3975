use serde::Deserialize;

use super::ConfigError;

/// Who the device is.
///
/// Both fields are immutable after load. The device ID is sent verbatim as identity
/// context on the issuer request, while its normalized form is used in the discovery
/// query name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceIdentity {
    /// Device identifier in `<scheme>:<value>` form, e.g. `mac:112233445566`.
    pub device_id: String,
    /// Partner the device belongs to. May be empty.
    #[serde(default)]
    pub partner_id: String,
}

/// Device ID schemes understood when building the discovery query name.
const DEVICE_ID_SCHEMES: [&str; 5] = ["mac", "uuid", "serial", "event", "dns"];

impl DeviceIdentity {
    /// Returns the device identifier with its scheme stripped and lowercased.
    ///
    /// MAC addresses have their separators removed:
    /// `mac:11:22:33:44:55:66` becomes `112233445566`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDeviceId`] if the scheme is unknown, the value is
    /// empty, or a MAC address is not 12 or 16 hex digits.
    pub fn normalized_device_id(&self) -> Result<String, ConfigError> {
        let invalid = || ConfigError::InvalidDeviceId(self.device_id.clone());

        let (scheme, value) = self.device_id.split_once(':').ok_or_else(invalid)?;
        let scheme = scheme.to_ascii_lowercase();
        if !DEVICE_ID_SCHEMES.contains(&scheme.as_str()) || value.is_empty() {
            return Err(invalid());
        }

        if scheme == "mac" {
            let digits: String = value
                .chars()
                .filter(|c| !matches!(c, ':' | '-' | '.' | ','))
                .collect();
            if !matches!(digits.len(), 12 | 16) || !digits.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(invalid());
            }
            return Ok(digits.to_ascii_lowercase());
        }

        Ok(value.to_ascii_lowercase())
    }
}

/// Hardware facts reported to the issuer. Opaque to resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Hardware {
    /// Hardware model.
    pub model: String,
    /// Serial number.
    pub serial_number: String,
    /// Manufacturer name.
    pub manufacturer: String,
    /// Reason given for the last reboot.
    pub last_reboot_reason: String,
}

/// Firmware facts reported to the issuer. Opaque to resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Firmware {
    /// Firmware name / version string.
    pub name: String,
}

/// Checks that `name` is a sequence of dot-separated DNS labels.
///
/// Labels are 1..=63 characters of ASCII alphanumerics, `-` or `_`, and may not start
/// or end with `-`. A single trailing dot is tolerated.
pub(crate) fn validate_dns_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidDnsName {
        field,
        value: name.to_owned(),
    };

    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() || trimmed.len() > 253 {
        return Err(invalid());
    }

    for label in trimmed.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(invalid());
        }
    }

    Ok(())
}
