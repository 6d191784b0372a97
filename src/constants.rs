//! # Constants
//!
//! Shared constants used throughout the controller. These values represent
//! the spec-mandated defaults and can be overridden via environment
//! variables where noted.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Requeue delay after an execution failure (Git, forge, encryption, projection).
pub const REQUEUE_EXECUTION_FAILURE_SECS: u64 = 300;

/// Requeue delay when a probe's gating condition is unmet.
pub const REQUEUE_PROBE_UNMET_SECS: u64 = 120;

/// Requeue delay for terminal-state TTL polling.
pub const REQUEUE_TERMINAL_POLL_SECS: u64 = 60;

/// Maximum number of optimistic-concurrency retries on a status write.
pub const STATUS_WRITE_MAX_RETRIES: u32 = 3;

/// Spacing between optimistic-concurrency status write retries.
pub const STATUS_WRITE_RETRY_SPACING_MS: u64 = 100;

/// Default size of the reconciler's bounded worker pool.
pub const DEFAULT_CONTROLLER_CONCURRENCY: u16 = 10;

/// Default bound on `maxExecutionHistory` when unset.
pub const DEFAULT_MAX_EXECUTION_HISTORY: i32 = 10;

/// Maximum response body length retained in a probe's status.
pub const PROBE_RESPONSE_TRUNCATE_BYTES: usize = 1024;

/// Default username used for HTTPS basic auth against Git remotes when the
/// credential object does not specify one.
pub const DEFAULT_GIT_USERNAME: &str = "oauth2";

/// Commit author identity used for every commit this controller authors.
pub const COMMIT_AUTHOR_NAME: &str = "Git Change Operator";
pub const COMMIT_AUTHOR_EMAIL: &str = "git-change-operator@galos.one";

/// Default file mode for materialized files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default directory mode for auto-created parent directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;
