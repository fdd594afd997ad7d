use crate::ptid::Ptid;
use crate::sig::Sig;

/// Normalized description of what happened to a debuggee entity since it
/// last ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The thread stopped with the given signal.
    Stopped(Sig),

    /// The process exited normally with the given exit code.
    Exited(i32),

    /// The process was terminated by the given signal.
    Signalled(Sig),

    /// The thread forked; the payload names the child's main thread.
    Forked(Ptid),

    /// The thread vforked; the payload names the child's main thread.
    Vforked(Ptid),

    /// A vfork child released its parent (exec'd or exited).
    VforkDone,

    /// The process replaced its image with the named one.
    Execd(String),

    /// A new thread was created; the payload names it.
    ThreadCreated(Ptid),

    /// A thread was cloned; the payload names the clone.
    ThreadCloned(Ptid),

    /// The thread exited with the given exit code.
    ThreadExited(i32),

    /// The thread entered the given syscall.
    SyscallEntry(i32),

    /// The thread returned from the given syscall.
    SyscallReturn(i32),

    /// No resumed thread is left to wait for.
    NoResumed,

    /// The thread stopped for no reason the backend can name; resume it.
    Spurious,

    /// Nothing happened; the event carries no information at all.
    Ignore,
}

impl WaitStatus {
    /// Returns whether this status ends the reporting thread's process.
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signalled(_))
    }

    /// Returns whether this status reports a fork-family child creation.
    pub fn forked_child(&self) -> Option<Ptid> {
        match *self {
            Self::Forked(child) | Self::Vforked(child) => Some(child),
            _ => None,
        }
    }
}

/// Outcome of driving the debuggee to its next stop.
#[derive(Clone, Debug)]
pub struct StopReport {
    /// Thread responsible for the stop.
    pub ptid: Ptid,

    /// What happened.
    pub status: WaitStatus,

    /// Whether the stop should be presented to the user.
    pub user_visible: bool,
}
