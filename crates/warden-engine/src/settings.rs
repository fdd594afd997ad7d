use crate::sig::SignalDispositions;

/// Which threads stay held while one thread is resumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerLocking {
    /// All threads of the scope run.
    #[default]
    Off,

    /// Only the selected thread ever runs.
    On,

    /// Only the selected thread runs during stepping commands.
    Step,

    /// Only the selected thread runs while replaying recorded execution.
    Replay,
}

/// Which branch of a fork the debugger stays attached to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FollowFork {
    /// Stay with the parent.
    #[default]
    Parent,

    /// Switch to the child.
    Child,
}

/// What becomes of the inferior when its process execs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FollowExec {
    /// Reuse the existing inferior for the new image.
    #[default]
    Same,

    /// Create a fresh inferior for the new image.
    New,
}

/// Whether displaced stepping may be used for step-overs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisplacedStepping {
    /// Use it whenever the target supports it.
    #[default]
    Auto,

    /// Never use it; always step in-line.
    Off,
}

/// How stepping treats calls into code without line information.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepOverCalls {
    /// Step into everything.
    None,

    /// Step over calls into undebuggable code only.
    #[default]
    Undebuggable,

    /// Step over every call.
    All,
}

/// Run-control policy knobs.
///
/// Owned by the engine; callers mutate it between commands. File formats and
/// command-line surfaces live in outer layers.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Whether threads are stopped and resumed independently rather than as
    /// a whole debuggee.
    pub non_stop: bool,

    /// Scheduler-locking mode.
    pub scheduler_locking: SchedulerLocking,

    /// Whether a resume covers threads of all processes rather than only
    /// the current one.
    pub schedule_multiple: bool,

    /// Which fork branch to follow.
    pub follow_fork: FollowFork,

    /// Whether the unfollowed fork branch is detached (as opposed to kept
    /// as an independent stopped inferior).
    pub detach_fork: bool,

    /// What becomes of the inferior on exec.
    pub follow_exec: FollowExec,

    /// Whether displaced stepping may be used.
    pub displaced_stepping: DisplacedStepping,

    /// How stepping treats calls without line information.
    pub step_over_calls: StepOverCalls,

    /// How many traps at a recently removed breakpoint location are
    /// accepted as stale before being treated as random signals.
    pub moribund_trap_grace: u32,

    /// Per-signal handling of random stops.
    pub signal_dispositions: SignalDispositions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            non_stop: false,
            scheduler_locking: SchedulerLocking::default(),
            schedule_multiple: false,
            follow_fork: FollowFork::default(),
            detach_fork: true,
            follow_exec: FollowExec::default(),
            displaced_stepping: DisplacedStepping::default(),
            step_over_calls: StepOverCalls::default(),
            moribund_trap_grace: 4,
            signal_dispositions: SignalDispositions::default(),
        }
    }
}
