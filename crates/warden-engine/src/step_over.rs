use crate::breakpoints::{BreakpointHere, Breakpoints};
use crate::control::RunControl;
use crate::displaced::PrepareStatus;
use crate::error::{BreakpointsError, TargetError};
use crate::inferior::AspaceId;
use crate::ptid::Ptid;
use crate::settings::DisplacedStepping;
use crate::sig::Sig;
use crate::target::Target;

/// What a thread has to get past before it can make progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Obstacle {
    /// An ordinary inserted breakpoint at the thread's PC.
    Breakpoint,

    /// A watchpoint the target cannot single-step past natively.
    Watchpoint,
}

/// The single in-line (stop-everyone) step-over presently active.
///
/// Valid only while the step-over is underway; breakpoints are not
/// re-inserted at the named location until it clears. One such token exists
/// per engine instance, never shared.
#[derive(Clone, Copy, Debug)]
pub struct StepOverInfo {
    /// Address space the obstacle lives in.
    pub aspace: AspaceId,

    /// Address of the obstacle.
    pub address: u64,

    /// Thread performing the step-over.
    pub thread: Ptid,

    /// Whether the obstacle is a watchpoint rather than a breakpoint.
    pub watchpoint: bool,
}

impl<T: Target, B: Breakpoints> RunControl<T, B> {
    /// Returns what, if anything, the given stopped thread must step over
    /// before it can run.
    pub(crate) fn needs_step_over(
        &mut self,
        ptid: Ptid,
    ) -> crate::Result<Option<Obstacle>, T::Error, B::Error> {
        let Some(thread) = self.threads.get(&ptid) else {
            return Ok(None);
        };

        if !thread.is_stopped() || thread.pending.is_some() {
            return Ok(None);
        }

        let Some(pc) = thread.stop_pc else {
            return Ok(None);
        };

        let aspace = self.inferiors[&thread.inferior].aspace;

        let here = self
            .breakpoints
            .breakpoint_here(aspace, pc)
            .map_err(BreakpointsError)?;

        if here == BreakpointHere::Ordinary {
            return Ok(Some(Obstacle::Breakpoint));
        }

        if self.threads[&ptid].stopped_by_watchpoint && !self.target.steppable_watchpoints() {
            return Ok(Some(Obstacle::Watchpoint));
        }

        Ok(None)
    }

    /// Queues a thread for a step-over turn.
    ///
    /// A queued thread is never `resumed`; violating that is a programming
    /// error, not a recoverable condition.
    pub(crate) fn queue_step_over(&mut self, ptid: Ptid) -> crate::Result<(), T::Error, B::Error> {
        let thread = self
            .threads
            .get(&ptid)
            .ok_or(crate::Error::UnknownThread(ptid))?;

        if thread.resumed {
            return Err(crate::Error::Inconsistency(
                "queueing a resumed thread for step-over",
            ));
        }

        if !self.step_over_queue.contains(&ptid) {
            tracing::debug!(%ptid, "queued for step-over");
            self.step_over_queue.push_back(ptid);
        }

        self.sync_thread_events()
    }

    /// Drains the step-over queue as far as resources allow.
    ///
    /// Displaced stepping is preferred when available (no serialization
    /// needed); otherwise a candidate is stepped in-line, which requires
    /// the singleton token to be free and stops every other thread for the
    /// duration. Candidates that cannot get a turn stay queued, FIFO.
    ///
    /// Returns whether at least one step-over was started.
    pub(crate) fn start_pending_step_overs(
        &mut self,
    ) -> crate::Result<bool, T::Error, B::Error> {
        let mut admitted = false;
        let candidates: Vec<Ptid> = self.step_over_queue.drain(..).collect();
        let mut inline_started = false;

        for ptid in candidates {
            if inline_started {
                // the in-line step-over owns the world; the rest wait
                self.step_over_queue.push_back(ptid);
                continue;
            }

            if !self.threads.contains_key(&ptid) {
                continue;
            }

            if self.threads[&ptid].pending.is_some() {
                // its stop must be delivered first
                self.step_over_queue.push_back(ptid);
                continue;
            }

            let Some(obstacle) = self.needs_step_over(ptid)? else {
                // the obstacle vanished (PC moved, breakpoint deleted);
                // resume the thread normally instead of stepping it
                tracing::debug!(%ptid, "obstacle gone; dequeued");
                self.threads[&ptid].trap_expected = false;
                let step = self.wants_hw_step(ptid);
                let sig = std::mem::replace(&mut self.threads[&ptid].resume_sig, Sig::NONE);
                self.resume_one(ptid, step, sig)?;
                continue;
            };

            if obstacle == Obstacle::Breakpoint && self.displaced_allowed(ptid) {
                match self.displaced_prepare(ptid)? {
                    PrepareStatus::Prepared(_) => {
                        self.threads[&ptid].trap_expected = true;
                        self.resume_one(ptid, true, Sig::NONE)?;
                        admitted = true;
                        continue;
                    }
                    PrepareStatus::Unavailable => {
                        self.step_over_queue.push_back(ptid);
                        continue;
                    }
                    PrepareStatus::Cant => {} // fall through to in-line
                }
            }

            if self.step_over.is_some() {
                self.step_over_queue.push_back(ptid);
                continue;
            }

            self.start_inline_step_over(ptid, obstacle)?;
            admitted = true;
            inline_started = true;
        }

        self.sync_thread_events()?;

        Ok(admitted)
    }

    fn displaced_allowed(&self, ptid: Ptid) -> bool {
        if self.settings.displaced_stepping == DisplacedStepping::Off {
            return false;
        }

        if !self.target.supports_displaced_step(ptid) {
            return false;
        }

        let inferior = &self.inferiors[&self.threads[&ptid].inferior];
        !inferior.displaced_disabled
    }

    /// Takes the singleton token and steps the thread in-line: the obstacle
    /// is physically lifted, every other thread is held stopped, and the
    /// thread single-steps the original instruction in place.
    fn start_inline_step_over(
        &mut self,
        ptid: Ptid,
        obstacle: Obstacle,
    ) -> crate::Result<(), T::Error, B::Error> {
        let thread = &self.threads[&ptid];
        let aspace = self.inferiors[&thread.inferior].aspace;
        let Some(address) = thread.stop_pc else {
            return Err(crate::Error::Inconsistency(
                "in-line step-over of a thread with no recorded stop PC",
            ));
        };
        let watchpoint = obstacle == Obstacle::Watchpoint;

        // concurrent-stop targets: everyone else must quiesce first
        if self.settings.non_stop {
            let executing: Vec<Ptid> = self
                .threads
                .values()
                .filter(|t| t.executing && t.ptid() != ptid)
                .map(crate::thread::Thread::ptid)
                .collect();

            for other in executing {
                self.threads[&other].paused_for_step_over = true;
                self.target.request_stop(other).map_err(TargetError)?;
            }
        }

        if !watchpoint {
            self.breakpoints
                .remove_at(aspace, address)
                .map_err(BreakpointsError)?;
        }

        self.step_over = Some(StepOverInfo {
            aspace,
            address,
            thread: ptid,
            watchpoint,
        });

        tracing::debug!(
            %ptid,
            address = format_args!("{address:#x}"),
            watchpoint,
            "in-line step-over started"
        );

        self.threads[&ptid].trap_expected = true;
        self.resume_one(ptid, true, Sig::NONE)
    }

    /// Releases the in-line step-over owned by the given thread and puts
    /// the lifted breakpoint back.
    pub(crate) fn finish_step_over(
        &mut self,
        ptid: Ptid,
    ) -> crate::Result<(), T::Error, B::Error> {
        let Some(info) = self.step_over.take() else {
            return Ok(());
        };

        if info.thread != ptid {
            self.step_over = Some(info);
            return Err(crate::Error::Inconsistency(
                "in-line step-over finished by a thread that does not own it",
            ));
        }

        if !info.watchpoint {
            self.breakpoints
                .insert_all(None)
                .map_err(BreakpointsError)?;
        }

        tracing::debug!(%ptid, "in-line step-over finished");

        self.sync_thread_events()
    }

    /// Abandons the active in-line step-over, if any, because a stop is
    /// about to be surfaced to the user. The lifted breakpoint goes back in
    /// and the owner loses the token; the obstacle is re-detected when the
    /// owner next proceeds.
    pub(crate) fn cancel_inline_step_over(&mut self) -> crate::Result<(), T::Error, B::Error> {
        let Some(info) = self.step_over.take() else {
            return Ok(());
        };

        if !info.watchpoint {
            self.breakpoints
                .insert_all(None)
                .map_err(BreakpointsError)?;
        }

        if let Some(owner) = self.threads.get_mut(&info.thread) {
            owner.trap_expected = false;
        }

        tracing::debug!(thread = %info.thread, "in-line step-over canceled");

        self.restart_paused_threads(Some(info.thread))?;
        self.sync_thread_events()
    }

    /// Resumes threads that were paused so an in-line step-over could run
    /// alone.
    ///
    /// A paused thread whose quiesce stop has not been consumed yet keeps
    /// its flag; the dispatcher restarts it when the stop arrives and the
    /// token is gone.
    pub(crate) fn restart_paused_threads(
        &mut self,
        except: Option<Ptid>,
    ) -> crate::Result<(), T::Error, B::Error> {
        let paused: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| t.paused_for_step_over && Some(t.ptid()) != except)
            .map(crate::thread::Thread::ptid)
            .collect();

        for ptid in paused {
            let thread = &self.threads[&ptid];
            if !thread.is_stopped() || thread.pending.is_some() || thread.stop_requested {
                continue;
            }

            self.threads[&ptid].paused_for_step_over = false;

            if !self.step_over_queue.contains(&ptid) {
                self.keep_going(ptid)?;
            }
        }

        Ok(())
    }

    /// Keeps target thread-event reporting on exactly while a step-over is
    /// queued or active; new threads must not be lost while the world is
    /// stopped.
    pub(crate) fn sync_thread_events(&mut self) -> crate::Result<(), T::Error, B::Error> {
        let want = !self.step_over_queue.is_empty() || self.step_over.is_some();

        if want != self.thread_events_on {
            self.target.thread_events(want).map_err(TargetError)?;
            self.thread_events_on = want;
        }

        Ok(())
    }
}
