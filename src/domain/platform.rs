use serde::{Deserialize, Serialize};

/// Capability descriptor for the embedding platform.
///
/// Built once at startup (usually from [`crate::config::Settings`]) and passed by
/// value into the bridge cache, the bridges it creates and the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformConstraints {
    /// Interpreters may run in parallel on worker threads
    #[serde(default = "default_true")]
    pub supports_parallel_execution: bool,
    /// A bridge may be entered again while one of its executions is suspended
    #[serde(default)]
    pub supports_reentrant_interpreter: bool,
    /// Ceiling for live interpreter bridges
    #[serde(default = "default_max_concurrent_bridges")]
    pub max_concurrent_bridges: usize,
    /// Interpreters may pause at host-call boundaries and resume later
    #[serde(default = "default_true")]
    pub supports_async_mode: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_bridges() -> usize {
    4
}

impl Default for PlatformConstraints {
    fn default() -> Self {
        Self {
            supports_parallel_execution: true,
            supports_reentrant_interpreter: false,
            max_concurrent_bridges: default_max_concurrent_bridges(),
            supports_async_mode: true,
        }
    }
}

impl PlatformConstraints {
    /// Profile for platforms that can only run one interpreter at a time
    /// and cannot suspend it mid-evaluation.
    pub fn single_threaded() -> Self {
        Self {
            supports_parallel_execution: false,
            supports_reentrant_interpreter: false,
            max_concurrent_bridges: 1,
            supports_async_mode: false,
        }
    }

    /// Number of interpreter bridges a cache keeps alive at once
    pub fn execution_permits(&self) -> usize {
        if self.supports_parallel_execution {
            self.max_concurrent_bridges.max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_permits_follow_parallel_flag() {
        let parallel = PlatformConstraints {
            max_concurrent_bridges: 3,
            ..Default::default()
        };
        assert_eq!(parallel.execution_permits(), 3);

        let serial = PlatformConstraints {
            supports_parallel_execution: false,
            max_concurrent_bridges: 3,
            ..Default::default()
        };
        assert_eq!(serial.execution_permits(), 1);
    }

    #[test]
    fn test_zero_bridges_still_grants_one_permit() {
        let constraints = PlatformConstraints {
            max_concurrent_bridges: 0,
            ..Default::default()
        };
        assert_eq!(constraints.execution_permits(), 1);
    }

    #[test]
    fn test_deserialize_defaults() {
        let constraints: PlatformConstraints = toml::from_str("").unwrap();
        assert_eq!(constraints, PlatformConstraints::default());
    }
}
