use crate::breakpoints::ResumeBpId;
use crate::inferior::InferiorId;
use crate::ptid::Ptid;
use crate::sig::Sig;
use crate::status::WaitStatus;
use crate::target::Relocation;

/// Coarse run state of a debuggee thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// The thread is stopped under debugger control.
    Stopped,

    /// The thread is (believed to be) running.
    Running,

    /// The thread has exited; the entry is about to be reaped.
    Exited,
}

/// What kind of step the user asked of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepKind {
    /// Not stepping; plain continuation.
    #[default]
    None,

    /// Step a single instruction.
    Instruction,

    /// Step until the PC leaves `[start, end)`, silently re-stepping while
    /// it stays inside.
    Range {
        /// First address of the range.
        start: u64,
        /// First address past the range.
        end: u64,
    },
}

impl StepKind {
    /// Returns whether this is any kind of step.
    pub fn is_step(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// In-progress displaced step of a thread.
#[derive(Debug)]
pub(crate) struct DisplacedStep {
    /// PC of the original instruction being stepped over.
    pub original_pc: u64,

    /// Scratch slot index within the owning inferior.
    pub slot: usize,

    /// Start address of the scratch slot.
    pub scratch_pc: u64,

    /// Bytes the scratch slot held before the relocated copy was written.
    pub saved: Vec<u8>,

    /// Backend relocation handle for the eventual fixup.
    pub relocation: Relocation,
}

/// Run-control state of one debuggee thread.
#[derive(Debug)]
pub struct Thread {
    ptid: Ptid,

    /// Inferior this thread belongs to.
    pub inferior: InferiorId,

    /// Coarse run state.
    pub state: ThreadState,

    /// The thread was asked to run and the result of that request has not
    /// been consumed yet. Distinct from [executing](Self::executing): a
    /// thread with a pending status is `resumed` but no longer executing.
    pub resumed: bool,

    /// The thread is actually running right now.
    pub executing: bool,

    /// Wait-status received but not yet delivered to the dispatcher.
    pub pending: Option<WaitStatus>,

    /// A user interrupt is outstanding for this thread.
    pub stop_requested: bool,

    /// The engine paused this thread so an in-line step-over could run
    /// alone. Cleared when the thread is restarted or reported.
    pub(crate) paused_for_step_over: bool,

    /// PC recorded at the last reported stop.
    pub stop_pc: Option<u64>,

    /// A trap is anticipated from a deliberate single-step or step-over.
    pub trap_expected: bool,

    /// The last reported stop was explained by a watchpoint.
    pub stopped_by_watchpoint: bool,

    /// What kind of step the user asked for.
    pub step: StepKind,

    /// Signal to deliver on the next resume.
    pub resume_sig: Sig,

    /// Engine-owned breakpoint this thread runs to before resuming its
    /// step, with its address.
    pub(crate) step_resume: Option<(ResumeBpId, u64)>,

    /// Displaced-step sub-state, while one is in progress.
    pub(crate) displaced: Option<DisplacedStep>,
}

impl Thread {
    pub(crate) fn new(ptid: Ptid, inferior: InferiorId) -> Self {
        Self {
            ptid,
            inferior,
            state: ThreadState::Stopped,
            resumed: false,
            executing: false,
            pending: None,
            stop_requested: false,
            paused_for_step_over: false,
            stop_pc: None,
            trap_expected: false,
            stopped_by_watchpoint: false,
            step: StepKind::None,
            resume_sig: Sig::NONE,
            step_resume: None,
            displaced: None,
        }
    }

    /// Returns this thread's identifier.
    pub fn ptid(&self) -> Ptid {
        self.ptid
    }

    /// Returns whether this thread is stopped with no unconsumed result.
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, ThreadState::Stopped) && !self.executing
    }

    /// Returns whether a displaced step is in progress for this thread.
    pub fn displaced_stepping(&self) -> bool {
        self.displaced.is_some()
    }

    /// Marks the thread resumed and executing.
    pub(crate) fn set_running(&mut self) {
        self.state = ThreadState::Running;
        self.resumed = true;
        self.executing = true;
    }

    /// Marks the thread stopped, consuming the resume request.
    pub(crate) fn set_stopped(&mut self) {
        self.state = ThreadState::Stopped;
        self.resumed = false;
        self.executing = false;
    }

    /// Drops all per-step state. Breakpoint handles must have been released
    /// by the caller beforehand.
    pub(crate) fn clear_step_state(&mut self) {
        self.step = StepKind::None;
        self.trap_expected = false;
        self.step_resume = None;
    }
}
