//! # Stepflow
//!
//! Resumable step pipelines for provisioning and tearing down clusters.
//!
//! A caller hands the [`Driver`] a cluster description, a profile and an
//! ordered list of step names. The driver resolves every name through the
//! [`StepRegistry`] before anything runs, then invokes each step's forward
//! or undo action in the given order, stopping at the first failure.
//!
//! ## Core Concepts
//!
//! - **Step**: a forward action and its compensating undo, split into
//!   individually tracked sub-steps
//! - **Completion Ledger**: which (cluster, step, sub-step) units already
//!   succeeded, so a re-run resumes instead of repeating side effects
//! - **Critical Section**: lease-based mutual exclusion over infrastructure
//!   shared between clusters
//! - **Telemetry**: a span around every step invocation, never affecting
//!   control flow
//!
//! ## Example
//!
//! ```ignore
//! use stepflow::{
//!     ClusterContext, Direction, Driver, RunOptions, Services, StaticConfig,
//!     RecordingSession,
//! };
//! use std::sync::Arc;
//!
//! let registry = my_steps::registry()?;
//! let services = Services::in_memory(Arc::new(RecordingSession::new()));
//! let mut driver = Driver::new(&registry, services, &StaticConfig::new())?;
//!
//! let mut cluster = ClusterContext::new("clu1").with_pair("kvm01", "vm01");
//! let result = driver.run_pipeline(
//!     &mut cluster,
//!     None,
//!     &["create-vm", "create-user"],
//!     Direction::Forward,
//!     &RunOptions::new("req-1"),
//! );
//! if let Some(error) = &result.error {
//!     println!("{:?} failed: {}", result.failed_step, error.message);
//! }
//! ```
//!
//! ## Collaborators
//!
//! The engine talks to the outside world only through traits:
//!
//! - [`HostSession`]: runs a command on a remote host
//! - [`ProgressStore`]: per-cluster status for operators
//! - [`CompletionLedger`]: durable sub-step completion records
//! - [`LockService`]: leases on shared resources
//! - [`SpanSink`]: where finished spans go
//! - [`ConfigSource`]: key/value settings read at start-up

pub mod cluster;
pub mod context;
pub mod driver;
pub mod error;
pub mod fanout;
pub mod ledger;
pub mod lock;
pub mod registry;
pub mod retry;
pub mod step;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use cluster::{ClusterContext, Direction, HostPair, Operation, Profile};
pub use context::{
    CommandOutput, ConfigSource, DriverSettings, Fault, HostSession, MemoryProgress,
    ProgressStatus, ProgressStore, RecordingSession, Remote, Services, StaticConfig,
};
pub use driver::Driver;
pub use error::{Error, ErrorKind, HostFailure, Result};
pub use fanout::{FanOutReport, fan_out};
pub use ledger::{CompletionLedger, CompletionRecord, CompletionState, LedgerBook, MemoryLedger};
pub use lock::{LeaseGuard, LeasePolicy, LeaseTable, LockLease, LockService};
pub use registry::{StepConstructor, StepRegistry, StepTable, TableEntry};
pub use retry::{RetryConfig, with_retry};
pub use step::{BoxedStep, Step, StepContext, StepKind, UndoPolicy};
pub use telemetry::{ExecutionSpan, JsonLinesSink, MemorySink, NullSink, SpanSink, Telemetry};
pub use types::{
    CompletedStep, DriverState, PipelineError, PipelineResult, RunOptions, StepOutcome,
    SubStepReport, SubStepStatus,
};
