use crate::breakpoints::{BreakpointHere, Breakpoints, LinePlacement, StopExplanation};
use crate::control::RunControl;
use crate::displaced::FinishStatus;
use crate::error::{BreakpointsError, TargetError};
use crate::events::Outcome;
use crate::ptid::Ptid;
use crate::settings::StepOverCalls;
use crate::sig::Sig;
use crate::status::{StopReport, WaitStatus};
use crate::target::Target;
use crate::thread::StepKind;

impl<T: Target, B: Breakpoints> RunControl<T, B> {
    /// Classifies a stopped-with-signal event: housekeeping to absorb, or a
    /// stop to surface.
    pub(crate) fn handle_signal_stop(
        &mut self,
        ptid: Ptid,
        sig: Sig,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let inferior_id = self.threads[&ptid].inferior;
        let aspace = self.inferiors[&inferior_id].aspace;

        let pc = self.normalize_stop_pc(ptid, sig)?;
        self.threads[&ptid].stop_pc = Some(pc);

        // a completed displaced step may convert a spurious trap; run its
        // finish before anything tries to interpret the signal
        if self.threads[&ptid].displaced_stepping() {
            match self.displaced_finish(ptid, &WaitStatus::Stopped(sig))? {
                FinishStatus::Completed => {
                    let pc = self.target.read_pc(ptid).map_err(TargetError)?;
                    self.threads[&ptid].stop_pc = Some(pc);
                    self.start_pending_step_overs()?;

                    if sig == Sig::TRAP && self.threads[&ptid].trap_expected {
                        self.threads[&ptid].trap_expected = false;
                        return self.continue_after_step_over(ptid, pc, aspace);
                    }
                }
                FinishStatus::NotExecuted => {
                    // finish restored the PC to the obstacle; re-read it
                    let pc = self.target.read_pc(ptid).map_err(TargetError)?;
                    self.threads[&ptid].stop_pc = Some(pc);

                    // a different stop intervened; keep a real signal for
                    // redelivery, but the quiesce signal of a stop request
                    // belongs to the engine, not the debuggee
                    if sig != Sig::TRAP && sig != Sig::STOP {
                        self.threads[&ptid].resume_sig = sig;
                    }

                    if self.threads[&ptid].stop_requested {
                        self.threads[&ptid].stop_requested = false;
                        return Ok(self.user_stop(ptid, WaitStatus::Stopped(Sig::NONE))?);
                    }

                    self.queue_step_over(ptid)?;
                    self.start_pending_step_overs()?;
                    return Ok(Outcome::Resume);
                }
            }
        }

        // completion of the in-line step-over this thread owns
        if sig == Sig::TRAP
            && self.threads[&ptid].trap_expected
            && self
                .step_over
                .as_ref()
                .is_some_and(|info| info.thread == ptid)
        {
            self.threads[&ptid].trap_expected = false;
            self.finish_step_over(ptid)?;
            self.start_pending_step_overs()?;

            if self.step_over.is_none() {
                self.restart_threads(Some(ptid))?;
            }

            return self.continue_after_step_over(ptid, pc, aspace);
        }

        let deliberate_step = sig == Sig::TRAP && self.threads[&ptid].trap_expected;
        if deliberate_step {
            self.threads[&ptid].trap_expected = false;
        }

        let explanation = self
            .breakpoints
            .stop_status(aspace, pc, ptid, &WaitStatus::Stopped(sig))
            .map_err(BreakpointsError)?;

        tracing::debug!(pc = format_args!("{pc:#x}"), ?explanation, "classified");

        self.threads[&ptid].stopped_by_watchpoint = explanation == StopExplanation::Watchpoint;

        // the thread's own step-resume breakpoint: remove it and pick the
        // interrupted step back up
        if sig == Sig::TRAP {
            if let Some((id, addr)) = self.threads[&ptid].step_resume {
                if addr == pc {
                    self.breakpoints.remove_resume(id).map_err(BreakpointsError)?;
                    self.threads[&ptid].step_resume = None;
                    self.keep_going(ptid)?;
                    return Ok(Outcome::Resume);
                }
            }
        }

        let explanation = if explanation == StopExplanation::Moribund && sig == Sig::TRAP {
            if self.accept_moribund_trap(aspace, pc) {
                self.keep_going(ptid)?;
                return Ok(Outcome::Resume);
            }
            StopExplanation::None
        } else {
            explanation
        };

        match explanation {
            StopExplanation::Breakpoint => {
                return Ok(self.user_stop(ptid, WaitStatus::Stopped(Sig::TRAP))?);
            }
            StopExplanation::Watchpoint => {
                return Ok(self.user_stop(ptid, WaitStatus::Stopped(Sig::TRAP))?);
            }
            StopExplanation::Catchpoint => {
                return Ok(self.user_stop(ptid, WaitStatus::Stopped(sig))?);
            }
            StopExplanation::None | StopExplanation::Moribund => {}
        }

        // an explicit stop request surfaces, as a zero-signal stop
        if self.threads[&ptid].stop_requested {
            self.threads[&ptid].stop_requested = false;
            return Ok(self.user_stop(ptid, WaitStatus::Stopped(Sig::NONE))?);
        }

        // quiet-startup stops surface regardless of signal policy
        if self.inferiors[&inferior_id].stop_soon {
            self.inferiors[&inferior_id].stop_soon = false;
            return Ok(self.user_stop(ptid, WaitStatus::Stopped(sig))?);
        }

        // quiesced by the engine so an in-line step-over could run alone;
        // nothing here is for the user
        if self.threads[&ptid].paused_for_step_over {
            // a real signal caught mid-pause gets redelivered on restart
            if sig != Sig::STOP && sig != Sig::NONE && sig != Sig::TRAP {
                self.threads[&ptid].resume_sig = sig;
            }

            if self.step_over.is_some() {
                tracing::debug!(%ptid, "quiesced for a step-over");
                return Ok(Outcome::Resume);
            }
            self.threads[&ptid].paused_for_step_over = false;
            self.keep_going(ptid)?;
            return Ok(Outcome::Resume);
        }

        if deliberate_step && self.threads[&ptid].step.is_step() {
            return self.step_range_test(ptid, pc, aspace);
        }

        // a random signal: nothing at this location explains the stop
        self.handle_random_signal(ptid, sig)
    }

    /// Undoes the break-instruction PC bias the backend didn't already
    /// correct.
    fn normalize_stop_pc(
        &mut self,
        ptid: Ptid,
        sig: Sig,
    ) -> crate::Result<u64, T::Error, B::Error> {
        let inferior = &self.inferiors[&self.threads[&ptid].inferior];
        let (aspace, decr) = (inferior.aspace, inferior.arch.decr_pc_after_break);

        let pc = self.target.read_pc(ptid).map_err(TargetError)?;

        if sig != Sig::TRAP || decr == 0 {
            return Ok(pc);
        }

        let biased = pc.wrapping_sub(decr);
        let here = self
            .breakpoints
            .breakpoint_here(aspace, biased)
            .map_err(BreakpointsError)?;

        if here == BreakpointHere::None {
            return Ok(pc);
        }

        self.target.write_pc(ptid, biased).map_err(TargetError)?;

        Ok(biased)
    }

    /// Picks the thread's own journey back up after it cleared an obstacle.
    fn continue_after_step_over(
        &mut self,
        ptid: Ptid,
        pc: u64,
        aspace: crate::inferior::AspaceId,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        // the stepped instruction may itself have tripped a watchpoint or
        // landed the thread somewhere reportable
        let explanation = self
            .breakpoints
            .stop_status(aspace, pc, ptid, &WaitStatus::Stopped(Sig::TRAP))
            .map_err(BreakpointsError)?;

        self.threads[&ptid].stopped_by_watchpoint = explanation == StopExplanation::Watchpoint;

        if matches!(
            explanation,
            StopExplanation::Breakpoint | StopExplanation::Watchpoint
        ) {
            return self.user_stop(ptid, WaitStatus::Stopped(Sig::TRAP));
        }

        // an interrupt that landed while the step-over ran must surface
        if self.threads[&ptid].stop_requested {
            self.threads[&ptid].stop_requested = false;
            return self.user_stop(ptid, WaitStatus::Stopped(Sig::NONE));
        }

        match self.threads[&ptid].step {
            StepKind::Instruction => {
                // the stepped-over instruction was the requested step
                Ok(self.end_step(ptid)?)
            }
            StepKind::Range { .. } => self.step_range_test(ptid, pc, aspace),
            StepKind::None => {
                self.keep_going(ptid)?;
                Ok(Outcome::Resume)
            }
        }
    }

    /// Decides what to do with a deliberate single-step that left (or
    /// stayed in) the active step range.
    fn step_range_test(
        &mut self,
        ptid: Ptid,
        pc: u64,
        aspace: crate::inferior::AspaceId,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let StepKind::Range { start, end } = self.threads[&ptid].step else {
            return self.end_step(ptid);
        };

        if (start..end).contains(&pc) {
            // still inside the line; step again silently
            self.keep_going(ptid)?;
            return Ok(Outcome::Resume);
        }

        let placement = self
            .breakpoints
            .line_placement(aspace, pc)
            .map_err(BreakpointsError)?;

        tracing::debug!(pc = format_args!("{pc:#x}"), ?placement, "left step range");

        match placement {
            LinePlacement::Trampoline { destination } => {
                if let Some(dest) = destination {
                    self.install_step_resume(ptid, aspace, dest)?;
                } // else keep single-stepping through the trampoline
                self.keep_going(ptid)?;
                Ok(Outcome::Resume)
            }

            LinePlacement::InlinedCallee { start, end } => {
                if self.settings.step_over_calls == StepOverCalls::None {
                    return self.end_step(ptid);
                }
                // skip the inline body like a call: widen the range over it
                self.threads[&ptid].step = StepKind::Range { start, end };
                self.keep_going(ptid)?;
                Ok(Outcome::Resume)
            }

            LinePlacement::NoLine => match self.settings.step_over_calls {
                StepOverCalls::All | StepOverCalls::Undebuggable => {
                    let ret = self.target.return_address(ptid).map_err(TargetError)?;
                    match ret {
                        Some(addr) => {
                            self.install_step_resume(ptid, aspace, addr)?;
                            self.keep_going(ptid)?;
                            Ok(Outcome::Resume)
                        }
                        // no way back out; ending the step here beats
                        // stepping blind through undebuggable code
                        None => self.end_step(ptid),
                    }
                }
                StepOverCalls::None => self.end_step(ptid),
            },

            LinePlacement::Line { .. } => self.end_step(ptid),
        }
    }

    fn install_step_resume(
        &mut self,
        ptid: Ptid,
        aspace: crate::inferior::AspaceId,
        addr: u64,
    ) -> crate::Result<(), T::Error, B::Error> {
        let id = self
            .breakpoints
            .insert_resume(aspace, addr)
            .map_err(BreakpointsError)?;

        tracing::debug!(addr = format_args!("{addr:#x}"), "step-resume breakpoint");

        self.threads[&ptid].step_resume = Some((id, addr));

        Ok(())
    }

    /// Finishes the thread's step and surfaces the stop, signal-free.
    fn end_step(&mut self, ptid: Ptid) -> crate::Result<Outcome, T::Error, B::Error> {
        self.user_stop(ptid, WaitStatus::Stopped(Sig::NONE))
    }

    /// Applies the signal-disposition table to an unexplained stop.
    fn handle_random_signal(
        &mut self,
        ptid: Ptid,
        sig: Sig,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        let disposition = self.settings.signal_dispositions.get(sig);

        tracing::debug!(%sig, ?disposition, "random signal");

        if disposition.stop {
            return self.user_stop(ptid, WaitStatus::Stopped(sig));
        }

        if disposition.pass {
            self.threads[&ptid].resume_sig = sig;
        }

        self.keep_going(ptid)?;

        Ok(Outcome::Resume)
    }

    /// Accepts a stale trap at a recently removed breakpoint, up to the
    /// configured grace bound per location.
    fn accept_moribund_trap(&mut self, aspace: crate::inferior::AspaceId, pc: u64) -> bool {
        let hits = self.moribund_hits.entry((aspace, pc)).or_insert(0);

        if *hits >= self.settings.moribund_trap_grace {
            return false;
        }

        *hits += 1;
        let accepted = *hits;
        tracing::debug!(
            pc = format_args!("{pc:#x}"),
            accepted,
            "accepted stale breakpoint trap"
        );

        true
    }

    /// Builds a user-visible stop report, tearing down per-step state.
    pub(crate) fn user_stop(
        &mut self,
        ptid: Ptid,
        status: WaitStatus,
    ) -> crate::Result<Outcome, T::Error, B::Error> {
        self.threads[&ptid].paused_for_step_over = false;

        // the stop ends the command; an in-flight in-line step-over must
        // not outlive it with the breakpoint still lifted
        self.cancel_inline_step_over()?;

        if let Some((id, _)) = self.threads[&ptid].step_resume.take() {
            self.breakpoints.remove_resume(id).map_err(BreakpointsError)?;
        }

        self.threads[&ptid].clear_step_state();

        Ok(Outcome::Report(StopReport {
            ptid,
            status,
            user_visible: true,
        }))
    }

    /// Restarts the threads held stopped for the duration of an in-line
    /// step-over.
    pub(crate) fn restart_threads(
        &mut self,
        except: Option<Ptid>,
    ) -> crate::Result<(), T::Error, B::Error> {
        self.restart_paused_threads(except)?;

        let Some(command) = self.command else {
            return Ok(());
        };

        let scope = self.compute_scope(command.ptid, command.stepping);
        self.resume_others(scope, except)
    }
}
