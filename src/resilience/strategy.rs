//! Backoff strategies mapping an attempt index to a delay.

use rand::rngs::OsRng;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lower bound (inclusive) of the multiplicative jitter band.
pub const JITTER_MIN: f64 = 0.5;
/// Upper bound (exclusive) of the multiplicative jitter band.
pub const JITTER_MAX: f64 = 1.5;

/// Default base delay of [`BackoffConfig::Exponential`].
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default delay cap of [`BackoffConfig::Exponential`].
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Computes the delay to wait before the next attempt.
pub trait RetryStrategy: Send + Sync {
    /// Returns the delay after the failure of attempt `attempt` (0-indexed).
    fn get_delay(&self, attempt: u32) -> Duration;
}

impl<S: RetryStrategy + ?Sized> RetryStrategy for Arc<S> {
    fn get_delay(&self, attempt: u32) -> Duration {
        (**self).get_delay(attempt)
    }
}

/// Source of multiplicative jitter factors.
///
/// Factors must lie in `[JITTER_MIN, JITTER_MAX)`; values outside the band are clamped.
#[cfg_attr(test, mockall::automock)]
pub trait JitterSource: Send + Sync {
    /// Returns the next jitter factor.
    fn jitter_factor(&self) -> f64;
}

/// Jitter drawn from the operating system's CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsJitter;

impl JitterSource for OsJitter {
    fn jitter_factor(&self) -> f64 {
        OsRng.gen_range(JITTER_MIN..JITTER_MAX)
    }
}

/// Exponential backoff: `min(base_delay * 2^attempt, max_delay)`, optionally jittered.
#[derive(Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    source: Arc<dyn JitterSource>,
}

impl ExponentialBackoff {
    /// Creates an exponential backoff using the OS random source for jitter.
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
            source: Arc::new(OsJitter),
        }
    }

    /// Replaces the jitter source.
    pub fn with_jitter_source(mut self, source: Arc<dyn JitterSource>) -> Self {
        self.source = source;
        self
    }

    /// Returns the un-jittered delay for `attempt`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Returns the base delay.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the delay cap.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns true if jitter is applied.
    pub fn jitter(&self) -> bool {
        self.jitter
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn get_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter {
            return nominal;
        }

        let factor = self.source.jitter_factor().clamp(JITTER_MIN, JITTER_MAX);
        // float-to-int casts saturate
        Duration::from_nanos((nominal.as_nanos() as f64 * factor) as u64)
    }
}

impl fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// Linear backoff: `delay + attempt * increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    delay: Duration,
    increment: Duration,
}

impl LinearBackoff {
    /// Creates a linear backoff.
    pub fn new(delay: Duration, increment: Duration) -> Self {
        Self { delay, increment }
    }
}

impl RetryStrategy for LinearBackoff {
    fn get_delay(&self, attempt: u32) -> Duration {
        self.delay
            .saturating_add(self.increment.saturating_mul(attempt))
    }
}

/// Declarative backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffConfig {
    /// See [`ExponentialBackoff`].
    Exponential {
        /// Delay after the first failure.
        base_delay: Duration,
        /// Upper bound on the nominal delay.
        max_delay: Duration,
        /// Whether to apply `[0.5, 1.5)` multiplicative jitter.
        jitter: bool,
    },
    /// See [`LinearBackoff`].
    Linear {
        /// Delay after the first failure.
        delay: Duration,
        /// Added per attempt.
        increment: Duration,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Builds the strategy described by this configuration.
    pub fn build_strategy(&self) -> Arc<dyn RetryStrategy> {
        match *self {
            BackoffConfig::Exponential {
                base_delay,
                max_delay,
                jitter,
            } => Arc::new(ExponentialBackoff::new(base_delay, max_delay, jitter)),
            BackoffConfig::Linear { delay, increment } => {
                Arc::new(LinearBackoff::new(delay, increment))
            }
        }
    }
}
