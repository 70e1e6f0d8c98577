//! Services - trip recording logic and state management
//!
//! This module contains the core recording services:
//! - `session` - Session state machine and fix pipeline orchestrator
//! - `smoother` - Kalman coordinate smoothing
//! - `speed` - Speed estimation and max-speed tracking
//! - `validator` - Ordered outlier rules
//! - `confirmation` - Deferred confirmation of suspicious points
//! - `sampler` - Adaptive point sampling
//! - `segments` - Append-only point log with pause-aware segments
//! - `simplifier` - Douglas-Peucker simplification and encoding
//! - `watchdog` - Location source liveness recovery

pub mod confirmation;
pub mod sampler;
pub mod segments;
pub mod session;
pub mod simplifier;
pub mod smoother;
pub mod speed;
pub mod validator;
pub mod watchdog;

// Re-export commonly used types
pub use session::{
    command_channel, IngestOutcome, IngestResult, Lifecycle, Session, SessionCommand, SessionError,
    SessionHandle,
};
pub use watchdog::{Watchdog, WatchdogAction, WatchdogAlert};
