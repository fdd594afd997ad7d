use warden_engine::ptid::Ptid;

/// Error returned by the simulated backend.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// The named process is not under simulation.
    #[error("unknown process {0}")]
    UnknownProcess(i32),

    /// The named thread is not under simulation.
    #[error("unknown thread {0}")]
    UnknownThread(Ptid),

    /// A blocking wait found runnable threads that can never make progress.
    #[error("no runnable thread can make progress")]
    Deadlock,

    /// The machine executed its step bound without producing an event.
    #[error("program ran {0} steps without an event")]
    Runaway(usize),
}
