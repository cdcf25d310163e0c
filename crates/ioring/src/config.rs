//! Ring configuration.

use crate::error::RingError;
use crate::{DEFAULT_COMPLETION_QUEUE_SIZE, DEFAULT_SUBMISSION_QUEUE_SIZE};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Environment variable overriding the backend of the shared ring
pub const BACKEND_ENV_VAR: &str = "IORING_BACKEND";

/// Largest submission queue the kernel accepts
pub const MAX_SUBMISSION_QUEUE_SIZE: u32 = 32_768;

/// Largest completion queue the kernel accepts
pub const MAX_COMPLETION_QUEUE_SIZE: u32 = 2 * MAX_SUBMISSION_QUEUE_SIZE;

/// Which engine executes requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BackendKind {
    /// Kernel io_uring when available, the emulated backend otherwise
    #[default]
    Auto,
    /// Kernel io_uring only; initialization fails where it is unavailable
    IoUring,
    /// Synchronous system calls performed at submission time
    Emulated,
}

impl BackendKind {
    /// Name as accepted by [`FromStr`] and configuration files
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::IoUring => "io_uring",
            BackendKind::Emulated => "emulated",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "io_uring" | "io-uring" | "uring" => Ok(BackendKind::IoUring),
            "emulated" | "sync" => Ok(BackendKind::Emulated),
            other => Err(RingError::InvalidConfig(format!("unknown backend '{other}'"))),
        }
    }
}

/// Parameters for building an [`IoRing`](crate::IoRing)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RingConfig {
    /// Requested submission queue entries; the kernel may round up
    pub submission_queue_size: u32,
    /// Requested completion queue entries; raised to the submission size when smaller
    pub completion_queue_size: u32,
    /// Engine selection
    pub backend: BackendKind,
    /// Submit to the kernel as soon as a request is staged. When false, staged
    /// requests are submitted by [`IoRing::submit_requests`](crate::IoRing::submit_requests),
    /// a wait, a drain, or a full submission queue.
    pub eager_submit: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            submission_queue_size: DEFAULT_SUBMISSION_QUEUE_SIZE,
            completion_queue_size: DEFAULT_COMPLETION_QUEUE_SIZE,
            backend: BackendKind::Auto,
            eager_submit: true,
        }
    }
}

impl RingConfig {
    /// Config with the given queue sizes and every other field defaulted
    #[must_use]
    pub fn with_sizes(submission_queue_size: u32, completion_queue_size: u32) -> Self {
        Self {
            submission_queue_size,
            completion_queue_size,
            ..Self::default()
        }
    }

    /// Default config with the backend taken from [`BACKEND_ENV_VAR`] when set.
    ///
    /// An unparsable value is logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(BACKEND_ENV_VAR) {
            match value.parse() {
                Ok(kind) => config.backend = kind,
                Err(e) => tracing::warn!("ignoring {}: {}", BACKEND_ENV_VAR, e),
            }
        }
        config
    }

    /// Check sizes against what the kernel accepts.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidConfig`] if a queue size is zero or above its maximum.
    pub fn validate(&self) -> Result<(), RingError> {
        if self.submission_queue_size == 0 || self.completion_queue_size == 0 {
            return Err(RingError::InvalidConfig(
                "queue sizes must be greater than 0".to_string(),
            ));
        }
        if self.submission_queue_size > MAX_SUBMISSION_QUEUE_SIZE {
            return Err(RingError::InvalidConfig(format!(
                "submission queue size {} exceeds {}",
                self.submission_queue_size, MAX_SUBMISSION_QUEUE_SIZE
            )));
        }
        if self.completion_queue_size > MAX_COMPLETION_QUEUE_SIZE {
            return Err(RingError::InvalidConfig(format!(
                "completion queue size {} exceeds {}",
                self.completion_queue_size, MAX_COMPLETION_QUEUE_SIZE
            )));
        }
        Ok(())
    }
}
