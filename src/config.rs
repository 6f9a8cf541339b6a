//! Store configuration
//!
//! Resolves the application secret (the static KDF input) and carries the
//! KDF parameters. Iteration counts can be lowered in test builds.

use std::fmt;
use std::time::Duration;

use zeroize::Zeroizing;

/// Name of the build-time (and native runtime) variable holding the secret
pub const SECRET_ENV_VAR: &str = "DEVCARD_SECRET_KEY";

/// Substituted when no secret is configured. Development only.
pub const DEVELOPMENT_SECRET: &str = "devcard-development-secret-not-for-production";

/// Minimum interval between two accepted token writes
pub const WRITE_COOLDOWN: Duration = Duration::from_millis(500);

/// Error types for configuration
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No application secret configured ({SECRET_ENV_VAR} is unset or empty)")]
    MissingSecret,
}

/// What to do when no application secret is configured
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MissingSecretPolicy {
    /// Substitute [`DEVELOPMENT_SECRET`] and warn
    #[default]
    UseDevelopmentSecret,
    /// Refuse to start
    Reject,
}

/// Where the resolved secret came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretSource {
    Configured,
    DevelopmentFallback,
}

/// Trimmed secret text; `None` when empty or whitespace-only
fn configured_value(raw: &str) -> Option<&str> {
    Some(raw.trim()).filter(|v| !v.is_empty())
}

/// Static, process-wide key-derivation input
///
/// Loaded once at startup and injected into the stores. Changing it makes
/// every previously stored value unreadable.
#[derive(Clone)]
pub struct ApplicationSecret {
    value: Zeroizing<String>,
    source: SecretSource,
}

impl ApplicationSecret {
    /// Wrap an explicitly provided secret
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            source: SecretSource::Configured,
        }
    }

    /// Resolve a possibly missing secret according to `policy`
    ///
    /// Empty and whitespace-only values count as missing.
    pub fn resolve(value: Option<&str>, policy: MissingSecretPolicy) -> Result<Self, ConfigError> {
        match value.and_then(configured_value) {
            Some(v) => Ok(Self::new(v)),
            None => match policy {
                MissingSecretPolicy::UseDevelopmentSecret => {
                    tracing::warn!(
                        env = SECRET_ENV_VAR,
                        "no application secret configured; falling back to the development secret, stored values are NOT meaningfully protected"
                    );
                    Ok(Self {
                        value: Zeroizing::new(DEVELOPMENT_SECRET.to_string()),
                        source: SecretSource::DevelopmentFallback,
                    })
                }
                MissingSecretPolicy::Reject => Err(ConfigError::MissingSecret),
            },
        }
    }

    /// Resolve from the value baked in at compile time
    pub fn from_build_env(policy: MissingSecretPolicy) -> Result<Self, ConfigError> {
        Self::resolve(option_env!("DEVCARD_SECRET_KEY"), policy)
    }

    /// Resolve from the process environment, then from the build-time value
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_env(policy: MissingSecretPolicy) -> Result<Self, ConfigError> {
        let runtime = std::env::var(SECRET_ENV_VAR).ok();
        match runtime.as_deref().and_then(configured_value) {
            Some(v) => Ok(Self::new(v)),
            None => Self::from_build_env(policy),
        }
    }

    #[must_use]
    pub fn source(&self) -> SecretSource {
        self.source
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        self.source == SecretSource::DevelopmentFallback
    }

    pub(crate) fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for ApplicationSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationSecret")
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// PBKDF2 parameters for the strong cipher suite
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    /// PBKDF2-HMAC-SHA256 iteration count
    pub iterations: u32,
}

impl KdfParams {
    /// Production value, matches what browsers use for Web Crypto PBKDF2
    pub const PROD: Self = Self { iterations: 100_000 };

    /// Test value for fast integration tests
    pub const TEST: Self = Self { iterations: 1_000 };

    /// Tiny value for unit tests (very fast)
    pub const TINY: Self = Self { iterations: 1 };
}

impl Default for KdfParams {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

/// Configuration shared by the secure stores and the token façade
#[derive(Clone, Debug)]
pub struct StoreConfig {
    secret: ApplicationSecret,
    kdf: KdfParams,
    write_cooldown: Duration,
}

impl StoreConfig {
    /// Create config with default KDF parameters
    #[must_use]
    pub fn new(secret: ApplicationSecret) -> Self {
        Self {
            secret,
            kdf: KdfParams::default(),
            write_cooldown: WRITE_COOLDOWN,
        }
    }

    /// Override KDF parameters (tests use [`KdfParams::TEST`] or [`KdfParams::TINY`])
    #[must_use]
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    #[must_use]
    pub fn secret(&self) -> &ApplicationSecret {
        &self.secret
    }

    #[must_use]
    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }

    #[must_use]
    pub fn write_cooldown(&self) -> Duration {
        self.write_cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_kdf_in_tests() {
        assert_eq!(KdfParams::default(), KdfParams::TEST);
    }

    #[test]
    fn test_prod_constants() {
        assert_eq!(KdfParams::PROD.iterations, 100_000);
        assert_eq!(WRITE_COOLDOWN, Duration::from_millis(500));
    }

    #[test]
    fn test_resolve_configured_secret() {
        let secret = ApplicationSecret::resolve(Some("s3cret"), MissingSecretPolicy::Reject).unwrap();
        assert_eq!(secret.expose(), "s3cret");
        assert_eq!(secret.source(), SecretSource::Configured);
    }

    #[test]
    fn test_missing_secret_falls_back() {
        let secret =
            ApplicationSecret::resolve(None, MissingSecretPolicy::UseDevelopmentSecret).unwrap();
        assert!(secret.is_development());
        assert_eq!(secret.expose(), DEVELOPMENT_SECRET);
    }

    #[test]
    fn test_blank_secret_counts_as_missing() {
        let err = ApplicationSecret::resolve(Some("   "), MissingSecretPolicy::Reject).unwrap_err();
        assert_eq!(err, ConfigError::MissingSecret);
    }

    #[test]
    #[cfg(not(target_arch = "wasm32"))]
    fn test_env_and_resolve_agree_on_padding() {
        std::env::set_var(SECRET_ENV_VAR, "  padded-secret \n");
        let from_env = ApplicationSecret::from_env(MissingSecretPolicy::Reject).unwrap();
        std::env::remove_var(SECRET_ENV_VAR);

        let resolved =
            ApplicationSecret::resolve(Some("  padded-secret \n"), MissingSecretPolicy::Reject).unwrap();
        assert_eq!(from_env.expose(), "padded-secret");
        assert_eq!(from_env.expose(), resolved.expose());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = ApplicationSecret::new("hunter2");
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_store_config_overrides() {
        let config = StoreConfig::new(ApplicationSecret::new("x")).with_kdf(KdfParams::TINY);
        assert_eq!(config.kdf().iterations, 1);
        assert_eq!(config.write_cooldown(), WRITE_COOLDOWN);
    }
}
