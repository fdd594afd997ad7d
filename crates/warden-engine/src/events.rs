use rand::Rng;

use crate::breakpoints::{Breakpoints, StopExplanation};
use crate::control::RunControl;
use crate::error::{BreakpointsError, TargetError};
use crate::ptid::{Ptid, ResumeScope};
use crate::settings::SchedulerLocking;
use crate::status::{StopReport, WaitStatus};
use crate::target::Target;
use crate::thread::Thread;

/// What the dispatcher decided about one event.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The event was absorbed; keep waiting.
    Resume,

    /// The event is worth reporting to the caller.
    Report(StopReport),
}

impl<T: Target, B: Breakpoints> RunControl<T, B> {
    /// Returns the next event to dispatch.
    ///
    /// Threads holding a pending (unreported) status are consumed first,
    /// picked at random among themselves; otherwise the per-process event
    /// sources are polled round-robin from a randomized starting index, and
    /// the poll blocks only when every source is dry.
    pub(crate) async fn wait_for_event(
        &mut self,
    ) -> crate::Result<(Ptid, WaitStatus), T::Error, B::Error> {
        loop {
            if let Some((ptid, status)) = self.take_pending_event() {
                tracing::debug!(%ptid, ?status, "delivering pending status");
                return Ok((ptid, status));
            }

            let pids: Vec<i32> = self.inferiors.values().map(|i| i.pid).collect();
            if !pids.is_empty() {
                let start = rand::thread_rng().gen_range(0..pids.len());

                for i in 0..pids.len() {
                    let pid = pids[(start + i) % pids.len()];
                    let event = self
                        .target
                        .wait(ResumeScope::Process(pid), true)
                        .await
                        .map_err(TargetError)?;

                    if let Some((ptid, status)) = event {
                        return Ok((ptid, status));
                    }
                }
            }

            let event = self
                .target
                .wait(ResumeScope::All, false)
                .await
                .map_err(TargetError)?;

            if let Some((ptid, status)) = event {
                return Ok((ptid, status));
            }
        }
    }

    /// Takes one pending status, picked at random among the holders.
    fn take_pending_event(&mut self) -> Option<(Ptid, WaitStatus)> {
        let holders: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| t.pending.is_some())
            .map(Thread::ptid)
            .collect();

        if holders.is_empty() {
            return None;
        }

        let ptid = holders[rand::thread_rng().gen_range(0..holders.len())];
        let thread = self.threads.get_mut(&ptid)?;
        let status = thread.pending.take()?;

        Some((ptid, status))
    }

    /// Routes one event through the state machine.
    ///
    /// Backend protocol violations (events for unknown threads) are logged
    /// and treated as ignorable; the debuggee's liveness must not depend on
    /// the debugger's introspection correctness.
    #[tracing::instrument(name = "HandleEvent", skip(self, status), fields(%ptid, ?status))]
    pub(crate) fn handle_event(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        match status {
            WaitStatus::Ignore => Ok(Outcome::Resume),

            WaitStatus::NoResumed => self.handle_no_resumed(ptid),

            WaitStatus::Exited(_) | WaitStatus::Signalled(_) => {
                self.handle_process_exit(ptid, status)
            }

            _ if !self.threads.contains_key(&ptid) => {
                tracing::warn!("event for unknown thread; ignored");
                Ok(Outcome::Resume)
            }

            WaitStatus::Spurious => {
                self.mark_event_thread_stopped(ptid)?;
                self.keep_going(ptid)?;
                Ok(Outcome::Resume)
            }

            WaitStatus::Stopped(sig) => {
                self.mark_event_thread_stopped(ptid)?;
                self.handle_signal_stop(ptid, sig)
            }

            WaitStatus::Forked(child) | WaitStatus::Vforked(child) => {
                self.mark_event_thread_stopped(ptid)?;
                let vfork = matches!(status, WaitStatus::Vforked(_));
                self.handle_fork_event(ptid, child, vfork, status)
            }

            WaitStatus::Execd(ref image) => {
                self.mark_event_thread_stopped(ptid)?;
                self.handle_exec_event(ptid, image.clone(), status.clone())
            }

            WaitStatus::VforkDone => {
                self.mark_event_thread_stopped(ptid)?;
                self.on_vfork_done(ptid)?;

                // the parent may have been detached on vfork-done
                if self.threads.contains_key(&ptid) {
                    self.keep_going(ptid)?;
                }

                Ok(Outcome::Resume)
            }

            WaitStatus::ThreadCreated(new) | WaitStatus::ThreadCloned(new) => {
                self.mark_event_thread_stopped(ptid)?;
                self.handle_thread_created(ptid, new)
            }

            WaitStatus::ThreadExited(_) => {
                // the thread is gone; its PC is not readable anymore
                if let Some(thread) = self.threads.get_mut(&ptid) {
                    thread.set_stopped();
                }
                self.handle_thread_exit(ptid)
            }

            WaitStatus::SyscallEntry(_) | WaitStatus::SyscallReturn(_) => {
                self.mark_event_thread_stopped(ptid)?;
                self.handle_syscall_event(ptid, status)
            }
        }
    }

    /// Consumes the event thread's resume request and refreshes its stop PC;
    /// dispatch decisions downstream key off where the thread stands now.
    fn mark_event_thread_stopped(&mut self, ptid: Ptid) -> crate::Result<(), T::Error, B::Error> {
        if self.threads.contains_key(&ptid) {
            self.threads[&ptid].set_stopped();

            let pc = self.target.read_pc(ptid).map_err(TargetError)?;
            self.threads[&ptid].stop_pc = Some(pc);
        }

        Ok(())
    }

    /// A fork-family event: let the lifecycle manager restructure state,
    /// then re-enter classification for catchpoints.
    fn handle_fork_event(
        &mut self,
        ptid: Ptid,
        child: Ptid,
        vfork: bool,
        status: WaitStatus,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        // a fork reported mid-displaced-step completes the step first; the
        // fixed-up PC must reach the child before anything else sees it
        if self.threads[&ptid].displaced_stepping() {
            self.displaced_finish(ptid, &status)?;
            self.threads[&ptid].trap_expected = false;
            self.start_pending_step_overs()?;
        }

        let followed = self.follow_fork(ptid, child, vfork)?;

        let aspace = self.inferiors[&self.threads[&followed].inferior].aspace;
        let pc = self.target.read_pc(followed).map_err(TargetError)?;
        let explanation = self
            .breakpoints
            .stop_status(aspace, pc, followed, &status)
            .map_err(BreakpointsError)?;

        if explanation == StopExplanation::Catchpoint {
            return Ok(Outcome::Report(StopReport {
                ptid: followed,
                status,
                user_visible: true,
            }));
        }

        self.keep_going(followed)?;

        Ok(Outcome::Resume)
    }

    /// An exec event: restructure, then re-enter classification for exec
    /// catchpoints.
    fn handle_exec_event(
        &mut self,
        ptid: Ptid,
        image: String,
        status: WaitStatus,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let ptid = self.follow_exec(ptid, &image)?;

        let aspace = self.inferiors[&self.threads[&ptid].inferior].aspace;
        let pc = self.target.read_pc(ptid).map_err(TargetError)?;

        // follow_exec dropped the stale stop PC; the new image's entry is
        // the authoritative one
        self.threads[&ptid].stop_pc = Some(pc);

        let explanation = self
            .breakpoints
            .stop_status(aspace, pc, ptid, &status)
            .map_err(BreakpointsError)?;

        if explanation == StopExplanation::Catchpoint {
            return Ok(Outcome::Report(StopReport {
                ptid,
                status,
                user_visible: true,
            }));
        }

        self.keep_going(ptid)?;

        Ok(Outcome::Resume)
    }

    /// A new thread appeared: record it, and hold it only if scheduling
    /// policy says so.
    fn handle_thread_created(
        &mut self,
        ptid: Ptid,
        new: Ptid,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let inferior = self.threads[&ptid].inferior;
        self.threads.insert(new, Thread::new(new, inferior));

        tracing::info!(%new, "thread created");

        let held_by_schedlock = matches!(
            self.settings.scheduler_locking,
            SchedulerLocking::On | SchedulerLocking::Step
        ) && self.command.is_some_and(|c| c.ptid != new);

        // while a step-over owns the world, newcomers wait with everyone else
        if self.step_over.is_none() && !held_by_schedlock {
            self.resume_one(new, false, crate::sig::Sig::NONE)?;
        }

        if self.step_over.as_ref().is_some_and(|info| info.thread != ptid) {
            // the creator is not the step-over owner; it stays stopped too
            return Ok(Outcome::Resume);
        }

        self.keep_going(ptid)?;

        Ok(Outcome::Resume)
    }

    /// A thread exited: release what it owned, then keep the rest going.
    fn handle_thread_exit(&mut self, ptid: Ptid) -> crate::Result<Outcome, T::Error, B::Error> {
        tracing::info!("thread exited");

        let was_command_thread = self.command.is_some_and(|c| c.ptid == ptid);

        self.delete_thread(ptid)?;

        if was_command_thread {
            return Err(crate::Error::CommandAborted(
                "the thread the command was issued for has exited",
            ));
        }

        self.start_pending_step_overs()?;

        Ok(Outcome::Resume)
    }

    /// A syscall boundary: only interesting if a catchpoint claims it.
    fn handle_syscall_event(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let aspace = self.inferiors[&self.threads[&ptid].inferior].aspace;
        let pc = self.target.read_pc(ptid).map_err(TargetError)?;
        let explanation = self
            .breakpoints
            .stop_status(aspace, pc, ptid, &status)
            .map_err(BreakpointsError)?;

        if explanation == StopExplanation::Catchpoint {
            return Ok(Outcome::Report(StopReport {
                ptid,
                status,
                user_visible: true,
            }));
        }

        self.keep_going(ptid)?;

        Ok(Outcome::Resume)
    }

    /// The whole process of the event thread is gone.
    fn handle_process_exit(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let Some(id) = self
            .inferiors
            .values()
            .find(|i| i.pid == ptid.pid)
            .map(crate::inferior::Inferior::id)
        else {
            tracing::warn!("exit event for unknown process; ignored");
            return Ok(Outcome::Resume);
        };

        // an exiting vfork child releases its parent implicitly
        self.release_vfork_parent_of(id)?;

        self.mourn_inferior(id)?;

        Ok(Outcome::Report(StopReport {
            ptid,
            status,
            user_visible: true,
        }))
    }

    /// The backend claims no resumed thread is left.
    ///
    /// During a foreground command, re-validate against the target's live
    /// thread lists before surfacing; the claim can race with our own
    /// resume bookkeeping.
    fn handle_no_resumed(&mut self, ptid: Ptid) -> crate::Result<Outcome, T::Error, B::Error> {
        if self.command.is_none() {
            return Ok(Outcome::Resume);
        }

        self.prune_dead_threads()?;

        let still_resumed = self
            .threads
            .values()
            .any(|t| t.resumed && (t.executing || t.pending.is_some()));

        if still_resumed {
            tracing::debug!("no-resumed raced with a live resume; ignored");
            return Ok(Outcome::Resume);
        }

        Ok(Outcome::Report(StopReport {
            ptid,
            status: WaitStatus::NoResumed,
            user_visible: true,
        }))
    }

    /// Reaps threads the target no longer knows (exits we never saw).
    fn prune_dead_threads(&mut self) -> crate::Result<(), T::Error, B::Error> {
        let pids: Vec<i32> = self.inferiors.values().map(|i| i.pid).collect();
        for pid in pids {
            let live = self.target.live_threads(pid).map_err(TargetError)?;
            let stale: Vec<Ptid> = self
                .threads
                .values()
                .filter(|t| t.ptid().pid == pid && !live.contains(&t.ptid()))
                .map(Thread::ptid)
                .collect();

            for gone in stale {
                tracing::debug!(%gone, "reaping thread unknown to the target");
                self.delete_thread(gone)?;
            }
        }

        Ok(())
    }

    /// Quiesces every thread of the debuggee before a stop is presented.
    ///
    /// In all-stop mode a stop in any thread is a stop of the whole
    /// debuggee; the fabricated stops are swallowed, while real events that
    /// race in are parked as pending statuses so nothing is lost.
    pub(crate) async fn stop_all_threads(&mut self) -> crate::Result<(), T::Error, B::Error> {
        loop {
            let executing: Vec<Ptid> = self
                .threads
                .values()
                .filter(|t| t.executing)
                .map(Thread::ptid)
                .collect();

            if executing.is_empty() {
                return Ok(());
            }

            for &ptid in &executing {
                if !self.threads[&ptid].stop_requested {
                    self.threads[&ptid].stop_requested = true;
                    self.target.request_stop(ptid).map_err(TargetError)?;
                }
            }

            let event = self
                .target
                .wait(ResumeScope::All, false)
                .await
                .map_err(TargetError)?;

            if let Some((ptid, status)) = event {
                self.absorb_quiesce_event(ptid, status)?;
            }
        }
    }

    /// Consumes one event while quiescing the debuggee.
    fn absorb_quiesce_event(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> crate::Result<(), T::Error, B::Error> {
        match status {
            WaitStatus::Stopped(sig)
                if (sig == crate::sig::Sig::STOP || sig == crate::sig::Sig::NONE)
                    && self.threads.get(&ptid).is_some_and(|t| t.stop_requested) =>
            {
                // the stop we asked for
                let pc = self.target.read_pc(ptid).map_err(TargetError)?;
                let thread = &mut self.threads[&ptid];
                thread.set_stopped();
                thread.stop_requested = false;
                thread.stop_pc = Some(pc);
                Ok(())
            }

            WaitStatus::ThreadExited(_) => {
                if let Some(thread) = self.threads.get_mut(&ptid) {
                    thread.set_stopped();
                }
                self.delete_thread(ptid)
            }

            WaitStatus::ThreadCreated(new) | WaitStatus::ThreadCloned(new) => {
                self.mark_event_thread_stopped(ptid)?;
                if let Some(creator) = self.threads.get(&ptid) {
                    let inferior = creator.inferior;
                    self.threads.insert(new, Thread::new(new, inferior));
                }
                Ok(())
            }

            WaitStatus::NoResumed => {
                // a thread we still count as executing may have exited
                // without a report; re-validate before asking again
                self.prune_dead_threads()
            }

            WaitStatus::Exited(_) | WaitStatus::Signalled(_) => {
                if let Some(id) = self
                    .inferiors
                    .values()
                    .find(|i| i.pid == ptid.pid)
                    .map(crate::inferior::Inferior::id)
                {
                    self.release_vfork_parent_of(id)?;
                    self.mourn_inferior(id)?;
                }
                Ok(())
            }

            other => {
                // a real event raced with the quiesce; park it
                if let Some(thread) = self.threads.get_mut(&ptid) {
                    thread.executing = false;
                    thread.state = crate::thread::ThreadState::Stopped;
                    thread.stop_requested = false;
                    thread.pending = Some(other);
                } else {
                    tracing::warn!(%ptid, "event for unknown thread while quiescing; dropped");
                }
                Ok(())
            }
        }
    }
}
