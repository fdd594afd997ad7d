use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::breakpoints::Breakpoints;
use crate::error::{BreakpointsError, TargetError};
use crate::inferior::{Inferior, InferiorId};
use crate::policy;
use crate::ptid::{Ptid, ResumeScope};
use crate::settings::Settings;
use crate::sig::Sig;
use crate::status::{StopReport, WaitStatus};
use crate::step_over::StepOverInfo;
use crate::target::Target;
use crate::thread::{StepKind, Thread, ThreadState};

/// What a [proceed](RunControl::proceed) call asks of the event thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProceedRequest {
    /// What kind of step to perform, if any.
    pub step: StepKind,

    /// Signal to deliver on resume ([Sig::NONE] for none).
    pub signal: Sig,
}

/// The foreground command currently driving the debuggee.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ActiveCommand {
    /// Thread the command was issued for.
    pub ptid: Ptid,

    /// Whether the command is a stepping command.
    pub stepping: bool,
}

/// Run-control engine instance.
///
/// Owns the target event source, the breakpoint side, and all per-thread and
/// per-process run-control state. The engine is a single-threaded
/// cooperative dispatcher: it suspends only inside the event-source poll,
/// and every other operation runs to completion before the next poll.
///
/// Several independent engines can coexist; nothing here is global.
pub struct RunControl<T: Target, B: Breakpoints> {
    pub(crate) target: T,
    pub(crate) breakpoints: B,
    pub(crate) settings: Settings,

    pub(crate) threads: IndexMap<Ptid, Thread>,
    pub(crate) inferiors: IndexMap<InferiorId, Inferior>,
    next_inferior_id: u32,

    /// Threads awaiting a turn to step over an obstacle, FIFO.
    pub(crate) step_over_queue: VecDeque<Ptid>,

    /// The single in-line step-over presently active, if any.
    pub(crate) step_over: Option<StepOverInfo>,

    /// Accepted stale traps per removed-breakpoint location.
    pub(crate) moribund_hits: IndexMap<(crate::inferior::AspaceId, u64), u32>,

    /// Whether thread-create/exit reporting is currently enabled at the
    /// target.
    pub(crate) thread_events_on: bool,

    pub(crate) command: Option<ActiveCommand>,
}

impl<T: Target, B: Breakpoints> RunControl<T, B> {
    /// Creates an engine over the given target and breakpoint side.
    pub fn new(target: T, breakpoints: B, settings: Settings) -> Self {
        Self {
            target,
            breakpoints,
            settings,
            threads: IndexMap::new(),
            inferiors: IndexMap::new(),
            next_inferior_id: 1,
            step_over_queue: VecDeque::new(),
            step_over: None,
            moribund_hits: IndexMap::new(),
            thread_events_on: false,
            command: None,
        }
    }

    /// Returns the engine's settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns a mutable reference to the engine's settings.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Registers an already-stopped process and its threads with the
    /// engine.
    ///
    /// The process is expected to be under target control and quiesced
    /// (freshly spawned or attached).
    #[tracing::instrument(name = "NewInferior", skip(self))]
    pub fn create_inferior(
        &mut self,
        pid: i32,
        tids: &[i64],
    ) -> crate::Result<InferiorId, T::Error, B::Error> {
        let (aspace, pspace) = self.target.spaces(pid).map_err(TargetError)?;
        let arch = self.target.arch(pid).map_err(TargetError)?;
        let buffers = self
            .target
            .displaced_step_buffers(pid)
            .map_err(TargetError)?;

        let id = InferiorId(self.next_inferior_id);
        self.next_inferior_id += 1;

        self.inferiors
            .insert(id, Inferior::new(id, pid, aspace, pspace, arch, buffers));

        for &tid in tids {
            let ptid = Ptid::new(pid, tid);
            self.threads.insert(ptid, Thread::new(ptid, id));
        }

        tracing::info!(%id, "inferior created");

        Ok(id)
    }

    /// Returns an iterator over the known threads.
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// Returns the run-control state of the given thread, if known.
    pub fn thread(&self, ptid: Ptid) -> Option<&Thread> {
        self.threads.get(&ptid)
    }

    /// Returns an iterator over the live inferiors.
    pub fn inferiors(&self) -> impl Iterator<Item = &Inferior> {
        self.inferiors.values()
    }

    /// Returns the given inferior, if alive.
    pub fn inferior(&self, id: InferiorId) -> Option<&Inferior> {
        self.inferiors.get(&id)
    }

    /// Returns the in-line step-over presently active, if any.
    pub fn step_over_active(&self) -> Option<&StepOverInfo> {
        self.step_over.as_ref()
    }

    /// Returns the threads queued for a step-over turn, front first.
    pub fn step_over_queue(&self) -> impl Iterator<Item = Ptid> + '_ {
        self.step_over_queue.iter().copied()
    }

    /// Checks the engine's concurrency invariants.
    ///
    /// A violation is a programming error; the corresponding command is
    /// aborted rather than worked around.
    pub fn check_invariants(&self) -> crate::Result<(), T::Error, B::Error> {
        for &ptid in &self.step_over_queue {
            let Some(thread) = self.threads.get(&ptid) else {
                return Err(crate::Error::Inconsistency(
                    "step-over queue names an unknown thread",
                ));
            };

            if thread.resumed {
                return Err(crate::Error::Inconsistency(
                    "thread both resumed and queued for step-over",
                ));
            }
        }

        for thread in self.threads.values() {
            if thread.resumed && !thread.executing && thread.pending.is_none() {
                return Err(crate::Error::Inconsistency(
                    "resumed thread neither executing nor holding a result",
                ));
            }
        }

        if let Some(info) = &self.step_over {
            let owner_displaced = self
                .threads
                .get(&info.thread)
                .is_some_and(Thread::displaced_stepping);

            if owner_displaced {
                return Err(crate::Error::Inconsistency(
                    "in-line step-over owner is also displaced-stepping",
                ));
            }
        }

        Ok(())
    }

    /// Prepares the given thread (and its scope) to run.
    ///
    /// Threads standing on an obstacle are routed through the step-over
    /// coordinator first; everything else in the computed resume scope is
    /// set running. Call [run_to_next_stop](Self::run_to_next_stop)
    /// afterwards to consume events.
    #[tracing::instrument(name = "Proceed", skip(self, request), fields(%ptid, step = ?request.step))]
    pub fn proceed(
        &mut self,
        ptid: Ptid,
        request: ProceedRequest,
    ) -> crate::Result<(), T::Error, B::Error> {
        let thread = self
            .threads
            .get_mut(&ptid)
            .ok_or(crate::Error::UnknownThread(ptid))?;

        if !thread.is_stopped() {
            return Err(crate::Error::NotStopped(ptid));
        }

        thread.step = request.step;
        thread.resume_sig = request.signal;
        thread.stop_requested = false;
        thread.paused_for_step_over = false;

        self.command = Some(ActiveCommand {
            ptid,
            stepping: request.step.is_step(),
        });

        let scope = self.compute_scope(ptid, request.step.is_step());
        tracing::debug!(%scope, "resume scope");

        // route threads standing on an obstacle through the coordinator
        let candidates: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| scope.contains(t.ptid()) && t.is_stopped() && t.pending.is_none())
            .map(Thread::ptid)
            .collect();

        for candidate in candidates {
            if self.needs_step_over(candidate)?.is_some() {
                self.queue_step_over(candidate)?;
            }
        }

        self.start_pending_step_overs()?;

        if self.step_over.is_some() {
            // an in-line step-over owns the world until it completes
            return self.check_invariants();
        }

        let event_thread = &self.threads[&ptid];
        if event_thread.is_stopped() && !self.step_over_queue.contains(&ptid) {
            let step = self.wants_hw_step(ptid);
            let sig = std::mem::replace(&mut self.threads[&ptid].resume_sig, Sig::NONE);
            self.resume_one(ptid, step, sig)?;
        }

        self.resume_others(scope, Some(ptid))?;

        self.check_invariants()
    }

    /// Drives the debuggee until a stop worth returning to the caller.
    ///
    /// Transparent events (spurious stops, silent step-range continuation,
    /// step-over completions, lifecycle housekeeping) are absorbed; the
    /// first reportable stop is returned.
    #[tracing::instrument(name = "RunToNextStop", skip_all)]
    pub async fn run_to_next_stop(&mut self) -> crate::Result<StopReport, T::Error, B::Error> {
        let report = loop {
            let (ptid, status) = self.wait_for_event().await?;

            match self.handle_event(ptid, status) {
                Ok(crate::events::Outcome::Resume) => continue,
                Ok(crate::events::Outcome::Report(report)) => break report,
                Err(e) => {
                    self.command = None;
                    return Err(e);
                }
            }
        };

        // a stop in any thread stops the whole debuggee in all-stop mode
        if !self.settings.non_stop && report.user_visible {
            self.stop_all_threads().await?;
        }

        self.command = None;
        self.check_invariants()?;

        Ok(report)
    }

    /// Requests a stop of every thread in the given scope.
    ///
    /// Running threads get an asynchronous stop request; threads already
    /// stopped but not yet reported get a fabricated zero-signal stop so
    /// the request is not lost.
    #[tracing::instrument(name = "RequestStop", skip(self), fields(%scope))]
    pub fn request_stop(&mut self, scope: ResumeScope) -> crate::Result<(), T::Error, B::Error> {
        let targets: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| scope.contains(t.ptid()) && !matches!(t.state, ThreadState::Exited))
            .map(Thread::ptid)
            .collect();

        for ptid in targets {
            let thread = &mut self.threads[&ptid];
            thread.stop_requested = true;

            if thread.executing {
                self.target.request_stop(ptid).map_err(TargetError)?;
            } else if thread.pending.is_none() {
                tracing::debug!(%ptid, "fabricating stop for already-stopped thread");
                thread.pending = Some(WaitStatus::Stopped(Sig::NONE));
            }
        }

        Ok(())
    }

    /// Detaches from the given inferior, letting its process run free.
    ///
    /// Any in-progress displaced step or in-line step-over of the process
    /// is first driven to completion, so the debuggee is never left with a
    /// PC inside a relocated scratch instruction.
    #[tracing::instrument(name = "Detach", skip(self), fields(%id))]
    pub async fn detach(&mut self, id: InferiorId) -> crate::Result<(), T::Error, B::Error> {
        let inferior = self
            .inferiors
            .get_mut(&id)
            .ok_or(crate::Error::UnknownInferior(id))?;
        let (pid, pspace) = (inferior.pid, inferior.pspace);
        inferior.detaching = true;

        self.stabilize_for_detach(id).await?;

        self.breakpoints
            .suppress_in(pspace)
            .map_err(BreakpointsError)?;
        self.target.detach(pid).map_err(TargetError)?;

        let gone: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| t.inferior == id)
            .map(Thread::ptid)
            .collect();
        for ptid in gone {
            self.delete_thread(ptid)?;
        }

        self.unlink_vfork_edges(id);
        self.inferiors.shift_remove(&id);

        tracing::info!("detached");

        Ok(())
    }

    /// Waits until no thread of the inferior owns a scratch slot or the
    /// in-line step-over token.
    async fn stabilize_for_detach(
        &mut self,
        id: InferiorId,
    ) -> crate::Result<(), T::Error, B::Error> {
        loop {
            let displaced_busy = self
                .threads
                .values()
                .any(|t| t.inferior == id && t.displaced_stepping());
            let inline_busy = self
                .step_over
                .as_ref()
                .is_some_and(|info| self.threads.get(&info.thread).is_some_and(|t| t.inferior == id));

            if !displaced_busy && !inline_busy {
                return Ok(());
            }

            tracing::debug!("stabilizing in-progress step-over before detach");

            let pid = self.inferiors[&id].pid;
            let event = self
                .target
                .wait(ResumeScope::Process(pid), false)
                .await
                .map_err(TargetError)?;

            let Some((ptid, status)) = event else {
                return Err(crate::Error::Inconsistency(
                    "event source dried up while stabilizing a step-over",
                ));
            };

            self.absorb_stabilization_event(ptid, status)?;
        }
    }

    /// Consumes one event during detach stabilization.
    ///
    /// Step-over completions are finished in place; anything else is parked
    /// as a pending status for the regular dispatcher.
    fn absorb_stabilization_event(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> crate::Result<(), T::Error, B::Error> {
        let Some(thread) = self.threads.get_mut(&ptid) else {
            tracing::warn!(%ptid, ?status, "event for unknown thread while stabilizing");
            return Ok(());
        };

        thread.executing = false;
        thread.state = ThreadState::Stopped;

        if self.threads[&ptid].displaced_stepping() {
            self.displaced_finish(ptid, &status)?;
            self.threads[&ptid].resumed = false;
            self.threads[&ptid].clear_step_state();
            return Ok(());
        }

        if self
            .step_over
            .as_ref()
            .is_some_and(|info| info.thread == ptid)
        {
            self.finish_step_over(ptid)?;
            self.threads[&ptid].resumed = false;
            self.threads[&ptid].clear_step_state();
            return Ok(());
        }

        let thread = &mut self.threads[&ptid];
        thread.pending = Some(status);

        Ok(())
    }

    /// Computes the resume scope for the given thread under current policy.
    pub(crate) fn compute_scope(&self, ptid: Ptid, is_step: bool) -> ResumeScope {
        let vfork_wait = self
            .inferiors
            .values()
            .find_map(|i| i.thread_waiting_for_vfork_done);

        policy::resume_scope(
            &self.settings,
            self.target.supports_multi_process(),
            vfork_wait,
            ptid,
            is_step,
            self.target.record_is_replaying(ptid),
        )
    }

    /// Whether resuming this thread requires hardware single-stepping.
    pub(crate) fn wants_hw_step(&self, ptid: Ptid) -> bool {
        let Some(thread) = self.threads.get(&ptid) else {
            return false;
        };

        // a thread running to its step-resume breakpoint continues freely
        thread.step.is_step() && thread.step_resume.is_none()
    }

    /// Marks the thread running and resumes it at the target.
    pub(crate) fn resume_one(
        &mut self,
        ptid: Ptid,
        step: bool,
        sig: Sig,
    ) -> crate::Result<(), T::Error, B::Error> {
        if self.step_over_queue.contains(&ptid) {
            return Err(crate::Error::Inconsistency(
                "resuming a thread queued for step-over",
            ));
        }

        let thread = self
            .threads
            .get_mut(&ptid)
            .ok_or(crate::Error::UnknownThread(ptid))?;

        // a thread interrupted mid-step-over must stay on hardware
        // single-step, or its completion trap is never produced
        let step = step || thread.displaced_stepping() || thread.trap_expected;

        // the classifier tells a deliberate single-step trap apart from a
        // stray SIGTRAP by this flag, so it must track every resume
        thread.trap_expected = step;

        thread.set_running();

        tracing::debug!(%ptid, step, %sig, "resume");

        self.target
            .resume(ResumeScope::Thread(ptid), step, sig)
            .map_err(TargetError)?;

        Ok(())
    }

    /// Resumes every eligible stopped thread of the scope, except the one
    /// named (already handled by the caller).
    pub(crate) fn resume_others(
        &mut self,
        scope: ResumeScope,
        except: Option<Ptid>,
    ) -> crate::Result<(), T::Error, B::Error> {
        let eligible: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| {
                scope.contains(t.ptid())
                    && Some(t.ptid()) != except
                    && t.is_stopped()
                    && t.pending.is_none()
                    && !self.step_over_queue.contains(&t.ptid())
            })
            .map(Thread::ptid)
            .collect();

        for ptid in eligible {
            let step = self.wants_hw_step(ptid);
            let sig = std::mem::replace(&mut self.threads[&ptid].resume_sig, Sig::NONE);
            self.resume_one(ptid, step, sig)?;
        }

        Ok(())
    }

    /// Continues the given thread the way it was going: re-queueing a
    /// step-over if it stands on an obstacle, stepping if it is mid-step,
    /// plain resume otherwise.
    pub(crate) fn keep_going(&mut self, ptid: Ptid) -> crate::Result<(), T::Error, B::Error> {
        if self.needs_step_over(ptid)?.is_some() {
            self.queue_step_over(ptid)?;
            self.start_pending_step_overs()?;
            return Ok(());
        }

        let step = self.wants_hw_step(ptid);
        let sig = std::mem::replace(&mut self.threads[&ptid].resume_sig, Sig::NONE);
        self.resume_one(ptid, step, sig)
    }

    /// Removes a thread, releasing any step-over or displaced-step
    /// ownership tied to it first.
    pub(crate) fn delete_thread(&mut self, ptid: Ptid) -> crate::Result<(), T::Error, B::Error> {
        self.step_over_queue.retain(|&p| p != ptid);

        if let Some(thread) = self.threads.get_mut(&ptid) {
            if let Some(displaced) = thread.displaced.take() {
                let inferior = thread.inferior;
                self.release_scratch_slot(inferior, displaced.slot);
            }

            if let Some((id, _)) = self.threads[&ptid].step_resume.take() {
                self.breakpoints.remove_resume(id).map_err(BreakpointsError)?;
            }
        }

        if self
            .step_over
            .as_ref()
            .is_some_and(|info| info.thread == ptid)
        {
            self.finish_step_over(ptid)?;
        }

        self.threads.shift_remove(&ptid);

        Ok(())
    }

    /// Removes an exited process and every thread it still had.
    pub(crate) fn mourn_inferior(
        &mut self,
        id: InferiorId,
    ) -> crate::Result<(), T::Error, B::Error> {
        let gone: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| t.inferior == id)
            .map(Thread::ptid)
            .collect();

        for ptid in gone {
            self.delete_thread(ptid)?;
        }

        self.unlink_vfork_edges(id);
        self.inferiors.shift_remove(&id);

        tracing::info!(%id, "inferior mourned");

        Ok(())
    }

    /// Clears any vfork edge pointing at the given inferior.
    pub(crate) fn unlink_vfork_edges(&mut self, id: InferiorId) {
        for inferior in self.inferiors.values_mut() {
            if inferior.vfork_child == Some(id) {
                inferior.vfork_child = None;
                inferior.thread_waiting_for_vfork_done = None;
            }
            if inferior.vfork_parent == Some(id) {
                inferior.vfork_parent = None;
            }
        }
    }

    /// Frees a scratch slot of the given inferior.
    pub(crate) fn release_scratch_slot(&mut self, id: InferiorId, slot: usize) {
        if let Some(inferior) = self.inferiors.get_mut(&id) {
            if let Some(entry) = inferior.scratch.get_mut(slot) {
                entry.occupied_by = None;
            }
        }
    }
}
