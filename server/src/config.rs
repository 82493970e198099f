//! Server configuration module.
//!
//! Parses configuration from environment variables for the Firewatch server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FIREWATCH_ALARM_KEYS` | Yes* | - | Format: `serial1:pubkey1,serial2:pubkey2` |
//! | `FIREWATCH_VAPID_PRIVATE_KEY` | Yes | - | Raw P-256 scalar, base64url |
//! | `FIREWATCH_VAPID_PUBLIC_KEY` | No | derived | Must match the private key if set |
//! | `FIREWATCH_VAPID_SUBJECT` | No | `mailto:admin@localhost` | VAPID contact URI |
//! | `FIREWATCH_CONFIRM_TIMEOUT_SECS` | No | 15 | Seconds an alarm waits for an answer (1-300) |
//! | `FIREWATCH_SESSION_TTL_SECS` | No | 3600 | Lifetime of a login session |
//! | `FIREWATCH_DIRECTORY_FILE` | No | - | JSON seed for users, alarms and devices |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `FIREWATCH_UNSAFE_NO_AUTH` | No | false | Disable all authentication (dev only) |
//!
//! *Not required if `FIREWATCH_UNSAFE_NO_AUTH=true`

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use base64::prelude::*;
use ed25519_dalek::PUBLIC_KEY_LENGTH;
use thiserror::Error;
use tracing::warn;

use crate::push::derive_vapid_public_key;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const DEFAULT_VAPID_SUBJECT: &str = "mailto:admin@localhost";

const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 15;

const MAX_CONFIRM_TIMEOUT_SECS: u64 = 300;

const DEFAULT_SESSION_TTL_SECS: u64 = crate::session::DEFAULT_TTL_SECS;

const MAX_SESSION_TTL_SECS: u64 = crate::session::MAX_TTL_SECS;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Map of alarm serial to base64-encoded Ed25519 public key.
    pub alarm_keys: HashMap<String, String>,

    /// HTTP server port.
    pub port: u16,

    /// When true, disables all authentication (development only).
    pub unsafe_no_auth: bool,

    /// VAPID signing key (raw P-256 scalar, base64url).
    pub vapid_private_key: String,

    /// Uncompressed VAPID public key handed to browsers (base64url).
    pub vapid_public_key: String,

    /// Contact URI placed in the VAPID `sub` claim.
    pub vapid_subject: String,

    /// How long `/confirm` waits for an answer.
    pub confirm_timeout: Duration,

    /// Lifetime of a login session.
    pub session_ttl: Duration,

    /// Optional JSON file used to seed the directory.
    pub directory_file: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("alarm_keys", &self.alarm_keys.len())
            .field("port", &self.port)
            .field("unsafe_no_auth", &self.unsafe_no_auth)
            .field("vapid_private_key", &"[REDACTED]")
            .field("vapid_public_key", &self.vapid_public_key)
            .field("vapid_subject", &self.vapid_subject)
            .field("confirm_timeout", &self.confirm_timeout)
            .field("session_ttl", &self.session_ttl)
            .field("directory_file", &self.directory_file)
            .finish()
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    /// - The VAPID key pair is invalid or inconsistent
    ///
    /// # Example
    ///
    /// ```no_run
    /// use firewatch_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let unsafe_no_auth = parse_bool_env("FIREWATCH_UNSAFE_NO_AUTH");
        let port = parse_port()?;
        let alarm_keys = parse_alarm_keys()?;

        let vapid_private_key = env::var("FIREWATCH_VAPID_PRIVATE_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("FIREWATCH_VAPID_PRIVATE_KEY".to_string()))?;
        let vapid_public_key = parse_vapid_public_key(&vapid_private_key)?;

        let vapid_subject = env::var("FIREWATCH_VAPID_SUBJECT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VAPID_SUBJECT.to_string());

        let confirm_timeout = Duration::from_secs(parse_secs_env(
            "FIREWATCH_CONFIRM_TIMEOUT_SECS",
            DEFAULT_CONFIRM_TIMEOUT_SECS,
        )?);
        let session_ttl = Duration::from_secs(parse_secs_env(
            "FIREWATCH_SESSION_TTL_SECS",
            DEFAULT_SESSION_TTL_SECS,
        )?);

        let directory_file = env::var("FIREWATCH_DIRECTORY_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let config = Self {
            alarm_keys,
            port,
            unsafe_no_auth,
            vapid_private_key,
            vapid_public_key,
            vapid_subject,
            confirm_timeout,
            session_ttl,
            directory_file,
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "FIREWATCH_UNSAFE_NO_AUTH is enabled - all authentication is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Alarm keys are required unless `unsafe_no_auth` is set; timeouts must
    /// be within range regardless.
    fn validate(&self) -> Result<(), ConfigError> {
        let timeout_secs = self.confirm_timeout.as_secs();
        if !(1..=MAX_CONFIRM_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(ConfigError::ValidationError(format!(
                "FIREWATCH_CONFIRM_TIMEOUT_SECS must be between 1 and {MAX_CONFIRM_TIMEOUT_SECS}, got {timeout_secs}"
            )));
        }

        let ttl_secs = self.session_ttl.as_secs();
        if !(1..=MAX_SESSION_TTL_SECS).contains(&ttl_secs) {
            return Err(ConfigError::ValidationError(format!(
                "FIREWATCH_SESSION_TTL_SECS must be between 1 and {MAX_SESSION_TTL_SECS}, got {ttl_secs}"
            )));
        }

        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.alarm_keys.is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "FIREWATCH_ALARM_KEYS".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a whole number of seconds, falling back to `default` when unset.
fn parse_secs_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a whole number of seconds, got '{value}'"),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Derive the VAPID public key and check it against
/// `FIREWATCH_VAPID_PUBLIC_KEY` when that is set.
fn parse_vapid_public_key(private_key: &str) -> Result<String, ConfigError> {
    let derived = derive_vapid_public_key(private_key).map_err(|e| ConfigError::InvalidFormat {
        var: "FIREWATCH_VAPID_PRIVATE_KEY".to_string(),
        message: e.to_string(),
    })?;

    match env::var("FIREWATCH_VAPID_PUBLIC_KEY") {
        Ok(configured) if !configured.trim().is_empty() => {
            if configured.trim().trim_end_matches('=') != derived {
                return Err(ConfigError::ValidationError(
                    "FIREWATCH_VAPID_PUBLIC_KEY does not match FIREWATCH_VAPID_PRIVATE_KEY"
                        .to_string(),
                ));
            }
            Ok(derived)
        }
        _ => Ok(derived),
    }
}

/// Parse the FIREWATCH_ALARM_KEYS environment variable.
///
/// Expected format: `serial1:pubkey1,serial2:pubkey2`
/// where pubkey is a base64-encoded Ed25519 public key.
fn parse_alarm_keys() -> Result<HashMap<String, String>, ConfigError> {
    let keys_str = match env::var("FIREWATCH_ALARM_KEYS") {
        Ok(s) if !s.is_empty() => s,
        _ => return Ok(HashMap::new()),
    };

    let mut keys = HashMap::new();

    for pair in keys_str.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let Some((serial, pubkey)) = pair.split_once(':') else {
            return Err(ConfigError::InvalidFormat {
                var: "FIREWATCH_ALARM_KEYS".to_string(),
                message: format!("expected 'serial:pubkey' format, got '{pair}'"),
            });
        };

        let serial = serial.trim();
        let pubkey = pubkey.trim();

        if serial.is_empty() {
            return Err(ConfigError::InvalidFormat {
                var: "FIREWATCH_ALARM_KEYS".to_string(),
                message: "serial cannot be empty".to_string(),
            });
        }

        let decoded_len = BASE64_STANDARD.decode(pubkey).map(|b| b.len()).ok();
        if decoded_len != Some(PUBLIC_KEY_LENGTH) {
            return Err(ConfigError::InvalidFormat {
                var: "FIREWATCH_ALARM_KEYS".to_string(),
                message: format!(
                    "pubkey for alarm '{serial}' must be a base64-encoded {PUBLIC_KEY_LENGTH}-byte Ed25519 key"
                ),
            });
        }

        keys.insert(serial.to_string(), pubkey.to_string());
    }

    Ok(keys)
}
