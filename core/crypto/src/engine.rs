//! String-level field encryption engine.
//!
//! The engine is the only component that holds the master key. It turns
//! plaintext strings into opaque ciphertext strings and back. Every other
//! component treats ciphertext as an opaque value and never parses it.
//!
//! # Ciphertext framing
//! `v1:` followed by standard base64 of `nonce || ciphertext || tag`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::aead;
use crate::kdf::{derive_master_key, KdfParams};
use crate::keys::MasterKey;
use dealvault_common::{Error, Result, SensitiveString};

/// Version tag prepended to every ciphertext string.
const CIPHERTEXT_PREFIX: &str = "v1:";

/// Well-known fallback secret for development and test deployments.
///
/// Never accepted in production, even when configured explicitly.
pub const DEVELOPMENT_MASTER_SECRET: &str = "development-only-key-not-for-production";

/// Environment variable holding the master secret.
pub const MASTER_SECRET_ENV: &str = "DEALVAULT_MASTER_KEY";

/// Environment variable naming the deployment environment.
pub const ENVIRONMENT_ENV: &str = "DEALVAULT_ENV";

/// Deployment environment, which decides the missing-secret policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Test => "test",
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            other => Err(Error::Config(format!("Unknown environment '{}'", other))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup configuration for the engine.
#[derive(Clone)]
pub struct EngineConfig {
    /// Raw master secret. `None` or blank means "not configured".
    pub master_secret: Option<Zeroizing<String>>,
    pub environment: Environment,
    pub kdf_params: KdfParams,
}

impl EngineConfig {
    pub fn new(master_secret: Option<String>, environment: Environment) -> Self {
        Self {
            master_secret: master_secret.map(Zeroizing::new),
            environment,
            kdf_params: KdfParams::default(),
        }
    }

    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    /// Read configuration from the process environment.
    ///
    /// `DEALVAULT_ENV` defaults to production so a bare deployment fails
    /// closed when the secret is missing.
    pub fn from_env() -> Result<Self> {
        let environment = match std::env::var(ENVIRONMENT_ENV) {
            Ok(value) => value.parse()?,
            Err(_) => Environment::Production,
        };
        let master_secret = std::env::var(MASTER_SECRET_ENV).ok();
        Ok(Self::new(master_secret, environment))
    }

    /// Resolve the secret to derive from, applying the startup policy.
    fn resolve_secret(&self) -> Result<(Zeroizing<String>, bool)> {
        let configured = self
            .master_secret
            .as_ref()
            .filter(|s| !s.trim().is_empty());

        match configured {
            Some(secret) if self.environment.is_production() => {
                if secret.as_str() == DEVELOPMENT_MASTER_SECRET {
                    return Err(Error::Config(format!(
                        "{} is set to the development placeholder in production",
                        MASTER_SECRET_ENV
                    )));
                }
                Ok((secret.clone(), false))
            }
            Some(secret) => {
                let is_placeholder = secret.as_str() == DEVELOPMENT_MASTER_SECRET;
                Ok((secret.clone(), is_placeholder))
            }
            None if self.environment.is_production() => Err(Error::Config(format!(
                "{} must be set in production",
                MASTER_SECRET_ENV
            ))),
            None => Ok((Zeroizing::new(DEVELOPMENT_MASTER_SECRET.to_string()), true)),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field(
                "master_secret",
                &self.master_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("environment", &self.environment)
            .field("kdf_params", &self.kdf_params)
            .finish()
    }
}

/// Field encryption engine.
///
/// Construct once at startup and share behind an `Arc`; encryption and
/// decryption are stateless per call.
pub struct EncryptionEngine {
    key: MasterKey,
    placeholder: bool,
}

impl EncryptionEngine {
    /// Build the engine from configuration, deriving the master key.
    ///
    /// # Errors
    /// - `Error::Config` if no usable secret is configured in production.
    ///   Callers must treat this as fatal and refuse to serve.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let (secret, placeholder) = config.resolve_secret()?;
        if placeholder {
            warn!(
                environment = %config.environment,
                "Using the development placeholder master secret"
            );
        }

        let key = derive_master_key(secret.as_bytes(), &config.kdf_params)?;
        info!(
            environment = %config.environment,
            fingerprint = %key.fingerprint(),
            "Field encryption engine initialized"
        );

        Ok(Self { key, placeholder })
    }

    /// Build the engine around an already-derived key.
    pub fn from_key(key: MasterKey) -> Self {
        Self {
            key,
            placeholder: false,
        }
    }

    /// Whether the engine runs on the development placeholder secret.
    pub fn uses_placeholder_key(&self) -> bool {
        self.placeholder
    }

    /// Encrypt a plaintext string.
    ///
    /// Returns `Ok(None)` for blank input; blank values are never stored.
    pub fn encrypt(&self, plaintext: &str) -> Result<Option<String>> {
        if plaintext.trim().is_empty() {
            return Ok(None);
        }

        let sealed = aead::encrypt(&self.key, plaintext.as_bytes())?;
        let mut framed = String::with_capacity(CIPHERTEXT_PREFIX.len() + sealed.len() * 4 / 3 + 4);
        framed.push_str(CIPHERTEXT_PREFIX);
        BASE64.encode_string(&sealed, &mut framed);
        Ok(Some(framed))
    }

    /// Decrypt a ciphertext string.
    ///
    /// Returns `None` when the value is blank, malformed, tampered with, or
    /// sealed under another key. Failures are logged at error level and never
    /// raised: one unreadable record must not break a listing. Callers treat
    /// `None` as "unavailable", never as an empty secret.
    pub fn decrypt(&self, ciphertext: &str) -> Option<SensitiveString> {
        if ciphertext.is_empty() {
            return None;
        }

        let Some(encoded) = ciphertext.strip_prefix(CIPHERTEXT_PREFIX) else {
            error!(reason = "framing", "Field decryption failed");
            return None;
        };

        let sealed = match BASE64.decode(encoded) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(_) => {
                error!(reason = "encoding", "Field decryption failed");
                return None;
            }
        };

        let plaintext = match aead::decrypt(&self.key, &sealed) {
            Ok(bytes) => bytes,
            Err(_) => {
                error!(reason = "authentication", "Field decryption failed");
                return None;
            }
        };

        match String::from_utf8(plaintext) {
            Ok(text) => Some(SensitiveString::new(text)),
            Err(e) => {
                drop(Zeroizing::new(e.into_bytes()));
                error!(reason = "utf8", "Field decryption failed");
                None
            }
        }
    }
}

impl fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("key", &self.key)
            .field("placeholder", &self.placeholder)
            .finish()
    }
}
