//! Configuration module for the resilience toolkit.
//!
//! Groups the per-component configurations into one [`ResilienceConfig`]
//! that can be built in code or read from `RESILIENCE_*` environment variables.

use std::time::Duration;

use crate::errors::ConfigError;
use crate::resilience::{
    BackoffConfig, CircuitBreakerConfig, IdempotencyConfig, RecoveryConfig, RetryConfig,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
};

/// Prefix shared by every environment variable read by [`ResilienceConfig::from_env`].
pub const ENV_PREFIX: &str = "RESILIENCE_";

/// Default delay of the linear strategy when selected from the environment.
pub const DEFAULT_LINEAR_DELAY: Duration = Duration::from_secs(1);

/// Default increment of the linear strategy when selected from the environment.
pub const DEFAULT_LINEAR_INCREMENT: Duration = Duration::from_secs(1);

/// Configuration for every toolkit component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResilienceConfig {
    /// Retry executor settings.
    pub retry: RetryConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Idempotency cache settings.
    pub idempotency: IdempotencyConfig,
    /// Recovery context settings.
    pub recovery: RecoveryConfig,
}

impl ResilienceConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// All optional; unset variables keep their defaults.
    ///
    /// - `RESILIENCE_MAX_ATTEMPTS`: total attempts per call
    /// - `RESILIENCE_BACKOFF`: `exponential` (default) or `linear`
    /// - `RESILIENCE_BASE_DELAY_MS`, `RESILIENCE_MAX_DELAY_MS`, `RESILIENCE_JITTER`: exponential settings
    /// - `RESILIENCE_LINEAR_DELAY_MS`, `RESILIENCE_LINEAR_INCREMENT_MS`: linear settings
    /// - `RESILIENCE_FAILURE_THRESHOLD`, `RESILIENCE_RECOVERY_TIMEOUT_MS`: circuit breaker
    /// - `RESILIENCE_IDEMPOTENCY_TTL_MS`, `RESILIENCE_IDEMPOTENCY_CLEANUP_INTERVAL_MS`: idempotency cache
    /// - `RESILIENCE_SAVE_STATE`: hand recovery reports to the state store
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Environment`] for values that do not parse and
    /// [`ConfigError::Invalid`] if the resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut builder = ResilienceConfigBuilder::new();

        if let Some(max_attempts) = env.parse("MAX_ATTEMPTS")? {
            builder = builder.max_attempts(max_attempts);
        }

        let backoff = env
            .get("BACKOFF")
            .map(|v| v.trim().to_ascii_lowercase());
        match backoff.as_deref() {
            None | Some("exponential") => {
                builder = builder.exponential_backoff(
                    env.millis("BASE_DELAY_MS")?.unwrap_or(DEFAULT_BASE_DELAY),
                    env.millis("MAX_DELAY_MS")?.unwrap_or(DEFAULT_MAX_DELAY),
                    env.flag("JITTER")?.unwrap_or(true),
                );
            }
            Some("linear") => {
                builder = builder.linear_backoff(
                    env.millis("LINEAR_DELAY_MS")?
                        .unwrap_or(DEFAULT_LINEAR_DELAY),
                    env.millis("LINEAR_INCREMENT_MS")?
                        .unwrap_or(DEFAULT_LINEAR_INCREMENT),
                );
            }
            Some(other) => {
                return Err(env.error("BACKOFF", other, "expected 'exponential' or 'linear'"));
            }
        }

        if let Some(threshold) = env.parse("FAILURE_THRESHOLD")? {
            builder = builder.failure_threshold(threshold);
        }
        if let Some(timeout) = env.millis("RECOVERY_TIMEOUT_MS")? {
            builder = builder.recovery_timeout(timeout);
        }
        if let Some(ttl) = env.millis("IDEMPOTENCY_TTL_MS")? {
            builder = builder.idempotency_ttl(ttl);
        }
        if let Some(interval) = env.millis("IDEMPOTENCY_CLEANUP_INTERVAL_MS")? {
            builder = builder.cleanup_interval(interval);
        }
        if let Some(save_state) = env.flag("SAVE_STATE")? {
            builder = builder.save_state(save_state);
        }

        builder.build()
    }

    /// Checks the construction constraints of every component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_attempts",
                "must be greater than zero",
            ));
        }

        match &self.retry.backoff {
            BackoffConfig::Exponential {
                base_delay,
                max_delay,
                ..
            } => {
                if base_delay.is_zero() {
                    return Err(ConfigError::invalid(
                        "base_delay",
                        "must be greater than zero",
                    ));
                }
                if max_delay < base_delay {
                    return Err(ConfigError::invalid(
                        "max_delay",
                        format!(
                            "must be at least base_delay ({}ms), got {}ms",
                            base_delay.as_millis(),
                            max_delay.as_millis()
                        ),
                    ));
                }
            }
            BackoffConfig::Linear { .. } => {}
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                "must be greater than zero",
            ));
        }
        if self.circuit_breaker.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "recovery_timeout",
                "must be greater than zero",
            ));
        }
        if self.idempotency.cache_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "cache_ttl",
                "must be greater than zero",
            ));
        }
        if self.idempotency.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid(
                "cleanup_interval",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Builder for [`ResilienceConfig`].
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    /// Creates a builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total number of attempts per call.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff policy.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.retry.backoff = backoff;
        self
    }

    /// Uses exponential backoff.
    pub fn exponential_backoff(self, base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        self.backoff(BackoffConfig::Exponential {
            base_delay,
            max_delay,
            jitter,
        })
    }

    /// Uses linear backoff.
    pub fn linear_backoff(self, delay: Duration, increment: Duration) -> Self {
        self.backoff(BackoffConfig::Linear { delay, increment })
    }

    /// Sets the circuit breaker failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Sets how long an open circuit rejects calls.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.recovery_timeout = timeout;
        self
    }

    /// Sets the idempotency cache TTL.
    pub fn idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.config.idempotency.cache_ttl = ttl;
        self
    }

    /// Sets the interval for an opt-in background sweep.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.idempotency.cleanup_interval = interval;
        self
    }

    /// Sets whether recovery reports are saved.
    pub fn save_state(mut self, save_state: bool) -> Self {
        self.config.recovery.save_state = save_state;
        self
    }

    /// Sets a fixed recovery state key.
    pub fn state_key(mut self, state_key: impl Into<String>) -> Self {
        self.config.recovery.state_key = Some(state_key.into());
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<ResilienceConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

struct EnvReader<L> {
    lookup: L,
}

impl<L> EnvReader<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn var(name: &str) -> String {
        format!("{ENV_PREFIX}{name}")
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&Self::var(name))
    }

    fn error(&self, name: &str, value: &str, message: impl Into<String>) -> ConfigError {
        ConfigError::Environment {
            var: Self::var(name),
            value: value.to_string(),
            message: message.into(),
        }
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| self.error(name, &raw, e.to_string())),
            None => Ok(None),
        }
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(name) {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(self.error(name, &raw, "expected a boolean")),
            },
            None => Ok(None),
        }
    }
}
