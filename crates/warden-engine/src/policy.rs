use crate::ptid::{Ptid, ResumeScope};
use crate::settings::{SchedulerLocking, Settings};

/// Computes how wide the next resume of `ptid` may be.
///
/// Pure function of the concurrency settings, the target's multi-process
/// capability, replay state, and the vfork-wait override: while a thread of
/// the scope waits for its vfork child to release the shared address space,
/// only that thread may run, because the OS itself holds the rest suspended.
pub(crate) fn resume_scope(
    settings: &Settings,
    multi_process: bool,
    vfork_wait: Option<Ptid>,
    ptid: Ptid,
    is_step: bool,
    is_replaying: bool,
) -> ResumeScope {
    if let Some(waiting) = vfork_wait {
        return ResumeScope::Thread(waiting);
    }

    if settings.non_stop {
        // threads are individually controlled; a resume never fans out
        return ResumeScope::Thread(ptid);
    }

    let locked = match settings.scheduler_locking {
        SchedulerLocking::On => true,
        SchedulerLocking::Step => is_step,
        SchedulerLocking::Replay => is_replaying,
        SchedulerLocking::Off => false,
    };

    if locked {
        return ResumeScope::Thread(ptid);
    }

    if settings.schedule_multiple || !multi_process {
        ResumeScope::All
    } else {
        ResumeScope::Process(ptid.pid)
    }
}
