use crate::inferior::InferiorId;
use crate::ptid::Ptid;

/// Target backend error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct TargetError<E>(pub E);

/// Breakpoint-side error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct BreakpointsError<E>(pub E);

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error<E1, E2> {
    /// A target backend error occurred.
    #[error(transparent)]
    Target(#[from] TargetError<E1>),

    /// A breakpoint-side error occurred.
    #[error(transparent)]
    Breakpoints(#[from] BreakpointsError<E2>),

    /// Run-control state violated an internal invariant.
    ///
    /// The current command is aborted; silently continuing would risk
    /// corrupting the debuggee.
    #[error("Run-control state is inconsistent: {0}")]
    Inconsistency(&'static str),

    /// The current command was aborted because thread state changed
    /// underfoot.
    #[error("Command aborted: {0}")]
    CommandAborted(&'static str),

    /// No thread with the given id is known.
    #[error("No thread {0}")]
    UnknownThread(Ptid),

    /// No inferior with the given id is known.
    #[error("No inferior {0}")]
    UnknownInferior(InferiorId),

    /// The operation requires a stopped thread.
    #[error("Thread {0} is not stopped")]
    NotStopped(Ptid),
}

/// Result type of this crate.
pub type Result<T, E1, E2> = core::result::Result<T, Error<E1, E2>>;
