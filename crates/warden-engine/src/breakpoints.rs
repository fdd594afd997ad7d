use crate::inferior::{AspaceId, PspaceId};
use crate::ptid::Ptid;
use crate::status::WaitStatus;

/// What, if anything, explains a raw stop at a given location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopExplanation {
    /// Nothing at this location explains the trap.
    None,

    /// An inserted breakpoint wants this stop reported.
    Breakpoint,

    /// A recently removed breakpoint could explain the trap; the thread was
    /// in flight when it was taken out.
    Moribund,

    /// A watchpoint triggered on this thread.
    Watchpoint,

    /// A fork/exec/syscall catchpoint wants this event reported.
    Catchpoint,
}

/// What kind of breakpoint, if any, sits at a given address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointHere {
    /// No breakpoint.
    None,

    /// An ordinary inserted breakpoint; a thread stopped here must step
    /// over it to make progress.
    Ordinary,

    /// A break instruction belonging to the program itself; stepping over
    /// it is meaningless.
    Permanent,
}

/// Where a PC sits relative to source-line information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinePlacement {
    /// Inside a source line spanning `[start, end)`.
    Line {
        /// First address of the line.
        start: u64,
        /// First address past the line.
        end: u64,
    },

    /// Inside a dynamic-linker trampoline. `destination` is the resolved
    /// landing address when the symbol side can compute one.
    Trampoline {
        /// Resolved destination, if known.
        destination: Option<u64>,
    },

    /// At the start of an inlined callee whose body spans `[start, end)`.
    InlinedCallee {
        /// First address of the inline body.
        start: u64,
        /// First address past the inline body.
        end: u64,
    },

    /// In a range with no line information.
    NoLine,
}

/// Handle of an engine-owned single-address resume breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResumeBpId(pub u64);

/// Trait implementing breakpoint/watchpoint evaluation and line lookup.
///
/// This is the face of the debugger's breakpoint and symbol side: condition
/// evaluation, user breakpoint bookkeeping and line tables live behind it.
/// The engine only directs *when* breakpoints are physically present.
pub trait Breakpoints {
    /// Error returned by this trait.
    type Error: std::error::Error;

    /// Explains a raw stop of `ptid` at `pc`, evaluating breakpoint and
    /// watchpoint conditions as needed.
    ///
    /// Also consulted with fork/exec/syscall statuses to check for
    /// catchpoints.
    fn stop_status(
        &mut self,
        aspace: AspaceId,
        pc: u64,
        ptid: Ptid,
        status: &WaitStatus,
    ) -> Result<StopExplanation, Self::Error>;

    /// Returns what kind of breakpoint sits at the given address.
    fn breakpoint_here(&self, aspace: AspaceId, pc: u64) -> Result<BreakpointHere, Self::Error>;

    /// Physically removes the breakpoint at the given address, keeping it
    /// registered. Used for the duration of an in-line step-over.
    fn remove_at(&mut self, aspace: AspaceId, addr: u64) -> Result<(), Self::Error>;

    /// Physically inserts all registered breakpoints, except at the skipped
    /// location if one is given.
    fn insert_all(&mut self, skip: Option<(AspaceId, u64)>) -> Result<(), Self::Error>;

    /// Physically removes all registered breakpoints.
    fn remove_all(&mut self) -> Result<(), Self::Error>;

    /// Physically removes all breakpoints registered against the given
    /// program space. Used while a vfork child shares it with its parent.
    fn suppress_in(&mut self, pspace: PspaceId) -> Result<(), Self::Error>;

    /// Re-inserts all breakpoints registered against the given program
    /// space, re-evaluating their addresses against the current image.
    fn reapply_to(&mut self, pspace: PspaceId) -> Result<(), Self::Error>;

    /// Inserts an engine-owned breakpoint at a single address.
    ///
    /// Hits on it are *not* reported by [stop_status](Self::stop_status);
    /// the engine matches the PC itself.
    fn insert_resume(&mut self, aspace: AspaceId, addr: u64) -> Result<ResumeBpId, Self::Error>;

    /// Removes an engine-owned resume breakpoint.
    fn remove_resume(&mut self, id: ResumeBpId) -> Result<(), Self::Error>;

    /// Returns where the given PC sits relative to line information.
    fn line_placement(&self, aspace: AspaceId, pc: u64) -> Result<LinePlacement, Self::Error>;
}
