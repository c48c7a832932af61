//! Healing strategies: an explicit matcher paired with a corrective action.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resilience_types::{codes, ErrorContext, Severity, SystemError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SelfHealingConfig;

/// Decides whether a strategy applies to an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorMatcher {
    /// Matches every error.
    Any,

    /// Exact error code.
    Code { code: String },

    /// Exact component.
    Component { component: String },

    /// Code and component both equal.
    CodeAndComponent { code: String, component: String },

    /// Any of the listed codes.
    CodeIn { codes: Vec<String> },

    /// Severity at or above the given level.
    MinSeverity { severity: Severity },

    /// Every inner matcher matches.
    AllOf { matchers: Vec<ErrorMatcher> },

    /// At least one inner matcher matches.
    AnyOf { matchers: Vec<ErrorMatcher> },
}

impl ErrorMatcher {
    /// Match on error code.
    pub fn code(code: impl Into<String>) -> Self {
        ErrorMatcher::Code { code: code.into() }
    }

    /// Match on originating component.
    pub fn component(component: impl Into<String>) -> Self {
        ErrorMatcher::Component {
            component: component.into(),
        }
    }

    /// Match on both code and component.
    pub fn code_and_component(code: impl Into<String>, component: impl Into<String>) -> Self {
        ErrorMatcher::CodeAndComponent {
            code: code.into(),
            component: component.into(),
        }
    }

    /// Match any of the given codes.
    pub fn code_in<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ErrorMatcher::CodeIn {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `error` satisfies this matcher.
    pub fn matches(&self, error: &SystemError) -> bool {
        match self {
            ErrorMatcher::Any => true,
            ErrorMatcher::Code { code } => error.code() == code,
            ErrorMatcher::Component { component } => error.component() == component,
            ErrorMatcher::CodeAndComponent { code, component } => {
                error.code() == code && error.component() == component
            }
            ErrorMatcher::CodeIn { codes } => codes.iter().any(|c| c == error.code()),
            ErrorMatcher::MinSeverity { severity } => error.severity() >= *severity,
            ErrorMatcher::AllOf { matchers } => matchers.iter().all(|m| m.matches(error)),
            ErrorMatcher::AnyOf { matchers } => matchers.iter().any(|m| m.matches(error)),
        }
    }
}

impl fmt::Display for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::Any => write!(f, "*"),
            ErrorMatcher::Code { code } => write!(f, "code={}", code),
            ErrorMatcher::Component { component } => write!(f, "component={}", component),
            ErrorMatcher::CodeAndComponent { code, component } => {
                write!(f, "code={} & component={}", code, component)
            }
            ErrorMatcher::CodeIn { codes } => write!(f, "code in [{}]", codes.join(", ")),
            ErrorMatcher::MinSeverity { severity } => write!(f, "severity>={}", severity),
            ErrorMatcher::AllOf { matchers } => {
                let parts: Vec<String> = matchers.iter().map(|m| m.to_string()).collect();
                write!(f, "({})", parts.join(" & "))
            }
            ErrorMatcher::AnyOf { matchers } => {
                let parts: Vec<String> = matchers.iter().map(|m| m.to_string()).collect();
                write!(f, "({})", parts.join(" | "))
            }
        }
    }
}

/// A corrective action (reconnect, cache clear, subsystem restart).
///
/// Actions may run more than once for the same failure and must be
/// idempotent.
#[async_trait]
pub trait HealingAction: Send + Sync {
    /// Attempt to fix the condition behind `error`.
    async fn heal(&self, error: &SystemError, context: &ErrorContext) -> Result<(), SystemError>;

    /// Short description for observability.
    fn description(&self) -> String {
        "custom".to_string()
    }
}

/// Wait out a transient condition, then let verification retry.
pub struct BackoffHealing {
    delay: Duration,
}

impl BackoffHealing {
    /// Wait `delay` before verification.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl HealingAction for BackoffHealing {
    async fn heal(&self, error: &SystemError, context: &ErrorContext) -> Result<(), SystemError> {
        if context.deadline_exceeded() {
            return Err(SystemError::deadline_exceeded(context.component()));
        }

        let delay = match context.remaining() {
            Some(remaining) => self.delay.min(remaining),
            None => self.delay,
        };
        debug!(code = error.code(), delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn description(&self) -> String {
        format!("backoff {}ms", self.delay.as_millis())
    }
}

/// Adapter turning an async closure into a [`HealingAction`].
pub struct FnHealing<F> {
    description: String,
    f: F,
}

impl<F, Fut> FnHealing<F>
where
    F: Fn(SystemError, ErrorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SystemError>> + Send + 'static,
{
    /// Wrap `f` under `description`.
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self {
            description: description.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> HealingAction for FnHealing<F>
where
    F: Fn(SystemError, ErrorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SystemError>> + Send + 'static,
{
    async fn heal(&self, error: &SystemError, context: &ErrorContext) -> Result<(), SystemError> {
        (self.f)(error.clone(), context.clone()).await
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

/// A matcher + action pair held in the priority-ordered registry.
#[derive(Clone)]
pub struct HealingStrategy {
    name: String,
    priority: u32,
    matcher: ErrorMatcher,
    action: Arc<dyn HealingAction>,
}

impl HealingStrategy {
    /// Lower priority values are tried first.
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        matcher: ErrorMatcher,
        action: impl HealingAction + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            matcher,
            action: Arc::new(action),
        }
    }

    /// Get the strategy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Get the matcher.
    pub fn matcher(&self) -> &ErrorMatcher {
        &self.matcher
    }

    /// Whether this strategy handles `error`.
    pub fn matches(&self, error: &SystemError) -> bool {
        self.matcher.matches(error)
    }

    pub(crate) fn action(&self) -> &Arc<dyn HealingAction> {
        &self.action
    }

    /// Observable description of this strategy.
    pub fn descriptor(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            name: self.name.clone(),
            priority: self.priority,
            matcher: self.matcher.to_string(),
            action: self.action.description(),
        }
    }
}

impl fmt::Debug for HealingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealingStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Observable description of a registered strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub name: String,
    pub priority: u32,
    pub matcher: String,
    pub action: String,
}

/// Built-in strategies for transient failures.
pub fn default_strategies(config: &SelfHealingConfig) -> Vec<HealingStrategy> {
    vec![
        HealingStrategy::new(
            "transient_network",
            100,
            ErrorMatcher::code_in([
                codes::CONNECTION_RESET,
                codes::TIMED_OUT,
                codes::CONNECTION_REFUSED,
            ]),
            BackoffHealing::new(config.transient_backoff),
        ),
        HealingStrategy::new(
            "rate_limit",
            110,
            ErrorMatcher::code(codes::RATE_LIMITED),
            BackoffHealing::new(config.rate_limit_backoff),
        ),
        HealingStrategy::new(
            "service_unavailable",
            120,
            ErrorMatcher::code(codes::SERVICE_UNAVAILABLE),
            BackoffHealing::new(config.transient_backoff.saturating_mul(2)),
        ),
    ]
}
