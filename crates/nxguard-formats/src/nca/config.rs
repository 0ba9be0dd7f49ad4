//! Processing options

use serde::{Deserialize, Serialize};

/// What to do with an unauthentic header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePolicy {
    /// Record the outcome and keep going
    #[default]
    Report,
    /// Fail the run unless the fixed-key signature verifies
    Enforce,
}

/// What to do when a partition fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and carry on with the other partitions
    #[default]
    Continue,
    /// Stop the whole run at the first partition failure
    Abort,
}

/// Options for [`NcaProcessor`](crate::nca::NcaProcessor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Walk every data block of every partition up front
    ///
    /// When off, partitions are reported as deferred and blocks are only
    /// checked as they are read.
    pub verify: bool,
    /// Header signature handling
    pub signature_policy: SignaturePolicy,
    /// Partition failure handling
    pub failure_policy: FailurePolicy,
    /// Process partitions on one thread each
    pub parallel: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            verify: true,
            signature_policy: SignaturePolicy::Report,
            failure_policy: FailurePolicy::Continue,
            parallel: false,
        }
    }
}

impl ProcessConfig {
    /// Defaults with every policy at its strictest
    pub fn strict() -> Self {
        Self {
            signature_policy: SignaturePolicy::Enforce,
            failure_policy: FailurePolicy::Abort,
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ProcessConfig =
            serde_json::from_str(r#"{"failure_policy": "abort", "parallel": true}"#).unwrap();
        assert!(config.verify);
        assert_eq!(config.signature_policy, SignaturePolicy::Report);
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert!(config.parallel);
    }

    #[test]
    fn test_strict() {
        let strict = ProcessConfig::strict();
        assert_eq!(strict.signature_policy, SignaturePolicy::Enforce);
        assert_eq!(strict.failure_policy, FailurePolicy::Abort);
        assert!(strict.verify);
    }
}
