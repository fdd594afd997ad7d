//! Run-control engine of an interactive debugger.
//!
//! Given a multi-threaded, possibly multi-process debuggee, this crate
//! decides — after every low-level stop event — whether to resume
//! transparently, let exactly one thread advance past a breakpoint while all
//! others wait, fabricate a single-step by executing a relocated copy of an
//! instruction, or surface a stop to the user.
//!
//! Two main components are provided:
//! - A pair of traits to plug in the platform-specific collaborators: a
//!   [Target](self::target::Target) turning OS primitives into normalized
//!   wait-statuses, and a [Breakpoints](self::breakpoints::Breakpoints)
//!   module owning breakpoint/watchpoint evaluation and line lookup.
//! - The [RunControl](self::control::RunControl) state machine tying them
//!   together: the event loop, the step-over coordinator, the displaced-step
//!   engine, the fork/exec lifecycle manager and the scheduling policy.
//!
//! # Driving the engine
//!
//! ```no_run
//! # use warden_sim::{SimBreakpoints, SimError, SimTarget};
//! # async fn doc(
//! #     target: SimTarget,
//! #     bps: SimBreakpoints,
//! # ) -> warden_engine::Result<(), SimError, SimError> {
//! use warden_engine::control::{ProceedRequest, RunControl};
//! use warden_engine::ptid::Ptid;
//! use warden_engine::settings::Settings;
//!
//! let mut engine = RunControl::new(target, bps, Settings::default());
//!
//! engine.create_inferior(1000, &[1000])?;
//! engine.proceed(Ptid::main(1000), ProceedRequest::default())?;
//!
//! let report = engine.run_to_next_stop().await?;
//! tracing::info!(?report.status, "stopped");
//! # Ok(())
//! # }
//! ```

/// Module defining the breakpoint/watchpoint collaborator contract.
pub mod breakpoints;

/// Module implementing the run-control state machine.
pub mod control;

/// Module defining process/thread identifiers and resume scopes.
pub mod ptid;

/// Module defining the engine's run-control settings.
pub mod settings;

/// Module defining backend-agnostic signal numbers and dispositions.
pub mod sig;

/// Module defining wait-statuses and stop reports.
pub mod status;

/// Module defining the target event-source contract.
pub mod target;

mod classify;
mod displaced;
mod error;
mod events;
mod follow;
mod inferior;
mod policy;
mod step_over;
mod thread;

pub use self::error::{BreakpointsError, Error, Result, TargetError};
pub use self::inferior::{AspaceId, Inferior, InferiorId, PspaceId};
pub use self::step_over::StepOverInfo;
pub use self::thread::{StepKind, Thread, ThreadState};
