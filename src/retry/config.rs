use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

type RetryPredicate = Arc<dyn Fn(u32, &(dyn StdError + 'static)) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Decides whether a failed attempt is retried.
#[derive(Clone)]
pub enum RetryLimit {
    /// Retry while fewer than this many retries were made. `Count(0)` never retries.
    Count(u32),
    /// Retry until the action succeeds or is invoked manually.
    Forever,
    /// Ask a predicate with the number of retries made so far and the error.
    Custom(RetryPredicate),
}

impl RetryLimit {
    /// Retries while `predicate(retry_count, error)` returns `true`.
    pub fn custom(
        predicate: impl Fn(u32, &(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Returns whether another attempt is allowed after `failure_count` retries.
    pub fn allows(&self, failure_count: u32, error: &(dyn StdError + 'static)) -> bool {
        match self {
            Self::Count(max) => failure_count < *max,
            Self::Forever => true,
            Self::Custom(predicate) => predicate(failure_count, error),
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::Count(DEFAULT_RETRIES)
    }
}

impl fmt::Debug for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(max) => f.debug_tuple("Count").field(max).finish(),
            Self::Forever => f.write_str("Forever"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How long to wait before a retry.
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `min(2^attempt * base, max)`.
    Exponential { base: Duration, max: Duration },
    /// Computed from the zero-based attempt number.
    Custom(DelayFn),
}

impl RetryDelay {
    /// Computes the delay from the zero-based attempt number.
    pub fn custom(delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(delay))
    }

    /// Returns the delay before retry number `attempt` (starting at 0).
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => 2_u32
                .checked_pow(attempt)
                .and_then(|factor| base.checked_mul(factor))
                .map_or(*max, |delay| delay.min(*max)),
            Self::Custom(delay) => delay(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retry behaviour of one action.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Whether a failed attempt is retried.
    pub retry: RetryLimit,
    /// How long to wait before each retry.
    pub delay: RetryDelay,
}

impl RetryOptions {
    /// Creates options from a retry limit and a delay.
    #[must_use]
    pub const fn new(retry: RetryLimit, delay: RetryDelay) -> Self {
        Self { retry, delay }
    }

    /// Replaces the retry limit.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryLimit) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the delay.
    #[must_use]
    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }
}

/// Per-action switch in a [`RetryConfig`].
#[derive(Debug, Clone)]
pub enum ActionRetry {
    /// Retry with the scope-wide defaults.
    Enabled,
    /// Never retry this action.
    Disabled,
    /// Retry with options of its own.
    Custom(RetryOptions),
}

/// Retry configuration of a scope, keyed by action name.
///
/// Actions that are not listed are never retried.
///
/// ```
/// use std::time::Duration;
/// use revalidate::retry::{RetryConfig, RetryDelay, RetryLimit, RetryOptions};
///
/// let config = RetryConfig::new()
///     .with_defaults(RetryOptions::new(RetryLimit::Count(3), RetryDelay::Fixed(Duration::ZERO)))
///     .enable("load_artworks")
///     .disable("save_draft");
///
/// assert!(config.options_for("load_artworks").is_some());
/// assert!(config.options_for("save_draft").is_none());
/// assert!(config.options_for("unknown").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    defaults: RetryOptions,
    actions: HashMap<String, ActionRetry>,
}

impl RetryConfig {
    /// Creates an empty configuration: nothing is retried.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the options used by actions enabled with [`enable`](Self::enable).
    #[must_use]
    pub fn with_defaults(mut self, defaults: RetryOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Retries `action` with the scope-wide defaults.
    #[must_use]
    pub fn enable(self, action: impl Into<String>) -> Self {
        self.with_action(action, ActionRetry::Enabled)
    }

    /// Never retries `action`.
    #[must_use]
    pub fn disable(self, action: impl Into<String>) -> Self {
        self.with_action(action, ActionRetry::Disabled)
    }

    /// Sets the retry behaviour of `action`.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>, retry: ActionRetry) -> Self {
        self.actions.insert(action.into(), retry);
        self
    }

    /// Returns the effective options for `action`, or `None` if it isn't retried.
    pub fn options_for(&self, action: &str) -> Option<&RetryOptions> {
        match self.actions.get(action)? {
            ActionRetry::Enabled => Some(&self.defaults),
            ActionRetry::Disabled => None,
            ActionRetry::Custom(options) => Some(options),
        }
    }

    /// Checks the configuration for settings that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRetryConfig`] for empty action names and for
    /// exponential delays with a zero base or a base above the cap.
    pub fn validate(&self) -> Result<()> {
        check_options("*", &self.defaults)?;
        for (action, retry) in &self.actions {
            if action.trim().is_empty() {
                return Err(invalid(action, "action name is empty"));
            }
            if let ActionRetry::Custom(options) = retry {
                check_options(action, options)?;
            }
        }
        Ok(())
    }
}

fn check_options(action: &str, options: &RetryOptions) -> Result<()> {
    if let RetryDelay::Exponential { base, max } = options.delay {
        if base.is_zero() {
            return Err(invalid(action, "exponential base delay is zero"));
        }
        if base > max {
            return Err(invalid(action, "exponential base delay exceeds its cap"));
        }
    }
    Ok(())
}

fn invalid(action: &str, reason: &str) -> Error {
    Error::InvalidRetryConfig {
        action: action.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;

    #[test]
    fn test_default_options() {
        let options = RetryOptions::default();
        let error = QueryError::FetchError("nope".to_string());

        assert!(options.retry.allows(0, &error));
        assert!(options.retry.allows(2, &error));
        assert!(!options.retry.allows(3, &error));

        assert_eq!(options.delay.for_attempt(0), Duration::from_secs(1));
        assert_eq!(options.delay.for_attempt(1), Duration::from_secs(2));
        assert_eq!(options.delay.for_attempt(4), Duration::from_secs(16));
        assert_eq!(options.delay.for_attempt(5), Duration::from_secs(30));
        assert_eq!(options.delay.for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_limits() {
        let error = QueryError::FetchError("nope".to_string());
        assert!(!RetryLimit::Count(0).allows(0, &error));
        assert!(RetryLimit::Forever.allows(u32::MAX, &error));

        let only_network = RetryLimit::custom(|count, error| {
            count < 5
                && matches!(
                    error.downcast_ref::<QueryError>(),
                    Some(QueryError::NetworkError(_))
                )
        });
        assert!(!only_network.allows(0, &error));
        assert!(only_network.allows(0, &QueryError::NetworkError("offline".to_string())));
    }

    #[test]
    fn test_custom_delay() {
        let delay = RetryDelay::custom(|attempt| Duration::from_millis(u64::from(attempt) * 100));
        assert_eq!(delay.for_attempt(3), Duration::from_millis(300));
        assert_eq!(RetryDelay::Fixed(Duration::ZERO).for_attempt(9), Duration::ZERO);
    }

    #[test]
    fn test_action_overrides() {
        let config = RetryConfig::new()
            .enable("load")
            .with_action("save", ActionRetry::Custom(RetryOptions::default().with_retry(RetryLimit::Count(1))));

        assert!(matches!(
            config.options_for("load").map(|options| &options.retry),
            Some(RetryLimit::Count(3))
        ));
        assert!(matches!(
            config.options_for("save").map(|options| &options.retry),
            Some(RetryLimit::Count(1))
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let empty_name = RetryConfig::new().enable(" ");
        assert!(matches!(
            empty_name.validate(),
            Err(Error::InvalidRetryConfig { .. })
        ));

        let inverted = RetryConfig::new().with_action(
            "load",
            ActionRetry::Custom(RetryOptions::default().with_delay(RetryDelay::Exponential {
                base: Duration::from_secs(60),
                max: Duration::from_secs(30),
            })),
        );
        assert_eq!(
            inverted.validate(),
            Err(Error::InvalidRetryConfig {
                action: "load".to_string(),
                reason: "exponential base delay exceeds its cap".to_string(),
            })
        );
    }
}
