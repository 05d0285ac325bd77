use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::error::AbortReason;

/// Default wall-clock budget of one execution
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource ceilings requested for an interpreter.
///
/// The timeout is always enforced by the bridge. Memory and stack depth are
/// enforced only by engines that report support for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: Option<usize>,
    pub max_stack_depth: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            memory_limit_bytes: None,
            max_stack_depth: None,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One-shot abort flag shared between the bridge driver and the engine worker.
///
/// The first reason set wins.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    reason: Arc<OnceLock<AbortReason>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, reason: AbortReason) {
        let _ = self.reason.set(reason);
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    pub fn is_triggered(&self) -> bool {
        self.reason.get().is_some()
    }
}
