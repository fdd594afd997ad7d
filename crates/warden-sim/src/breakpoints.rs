use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use warden_engine::breakpoints::{
    BreakpointHere, Breakpoints, LinePlacement, ResumeBpId, StopExplanation,
};
use warden_engine::ptid::Ptid;
use warden_engine::sig::Sig;
use warden_engine::status::WaitStatus;
use warden_engine::{AspaceId, PspaceId};

use crate::error::SimError;
use crate::machine::{Inner, StopReason, INSN_LEN};

struct LineEntry {
    space: u32,
    start: u64,
    end: u64,
    placement: LinePlacement,
}

#[derive(Default)]
struct State {
    registered: HashSet<(u32, u64)>,
    suppressed: HashSet<u32>,
    moribund: HashSet<(u32, u64)>,
    resume: HashMap<u64, (u32, u64)>,
    next_resume: u64,
    catch_forks: bool,
    catch_execs: bool,
    lines: Vec<LineEntry>,
}

/// Breakpoint side of a [SimMachine](crate::SimMachine).
///
/// Clones share state, so tests can keep one handle for registering and
/// deleting breakpoints while the engine owns another.
#[derive(Clone)]
pub struct SimBreakpoints {
    machine: Rc<RefCell<Inner>>,
    state: Rc<RefCell<State>>,
}

impl SimBreakpoints {
    pub(crate) fn new(machine: Rc<RefCell<Inner>>) -> Self {
        Self {
            machine,
            state: Rc::new(RefCell::new(State::default())),
        }
    }

    fn has_resume_at(state: &State, space: u32, addr: u64) -> bool {
        state.resume.values().any(|&loc| loc == (space, addr))
    }

    /// Registers (and plants) a user breakpoint.
    pub fn add_breakpoint(&self, aspace: AspaceId, addr: u64) {
        let mut state = self.state.borrow_mut();
        state.registered.insert((aspace.0, addr));

        if !state.suppressed.contains(&aspace.0) {
            self.machine.borrow_mut().insert_trap(aspace.0, addr);
        }
    }

    /// Deletes a user breakpoint entirely; the location becomes moribund.
    pub fn delete_breakpoint(&self, aspace: AspaceId, addr: u64) {
        let mut state = self.state.borrow_mut();
        state.registered.remove(&(aspace.0, addr));
        state.moribund.insert((aspace.0, addr));

        if !Self::has_resume_at(&state, aspace.0, addr) {
            self.machine.borrow_mut().remove_trap(aspace.0, addr);
        }
    }

    /// Registers a watchpoint covering one data address.
    pub fn add_watchpoint(&self, aspace: AspaceId, addr: u64) {
        self.machine
            .borrow_mut()
            .watchpoints
            .insert((aspace.0, addr));
    }

    /// Toggles the fork/vfork catchpoint.
    pub fn catch_forks(&self, on: bool) {
        self.state.borrow_mut().catch_forks = on;
    }

    /// Toggles the exec catchpoint.
    pub fn catch_execs(&self, on: bool) {
        self.state.borrow_mut().catch_execs = on;
    }

    fn add_line_entry(&self, aspace: AspaceId, start: u64, end: u64, placement: LinePlacement) {
        self.state.borrow_mut().lines.push(LineEntry {
            space: aspace.0,
            start,
            end,
            placement,
        });
    }

    /// Declares `[start, end)` a single source line.
    pub fn add_line(&self, aspace: AspaceId, start: u64, end: u64) {
        self.add_line_entry(aspace, start, end, LinePlacement::Line { start, end });
    }

    /// Declares `[start, end)` a linker trampoline.
    pub fn add_trampoline(&self, aspace: AspaceId, start: u64, end: u64, destination: Option<u64>) {
        self.add_line_entry(aspace, start, end, LinePlacement::Trampoline { destination });
    }

    /// Declares `[start, end)` the body of an inlined callee.
    pub fn add_inlined_callee(&self, aspace: AspaceId, start: u64, end: u64) {
        self.add_line_entry(aspace, start, end, LinePlacement::InlinedCallee { start, end });
    }

    /// Declares `[start, end)` void of line information.
    pub fn add_no_line(&self, aspace: AspaceId, start: u64, end: u64) {
        self.add_line_entry(aspace, start, end, LinePlacement::NoLine);
    }
}

impl Breakpoints for SimBreakpoints {
    type Error = SimError;

    fn stop_status(
        &mut self,
        aspace: AspaceId,
        pc: u64,
        ptid: Ptid,
        status: &WaitStatus,
    ) -> Result<StopExplanation, Self::Error> {
        let state = self.state.borrow();

        match status {
            WaitStatus::Forked(_) | WaitStatus::Vforked(_) => Ok(if state.catch_forks {
                StopExplanation::Catchpoint
            } else {
                StopExplanation::None
            }),

            WaitStatus::Execd(_) => Ok(if state.catch_execs {
                StopExplanation::Catchpoint
            } else {
                StopExplanation::None
            }),

            WaitStatus::Stopped(sig) if *sig == Sig::TRAP => {
                let reason = self.machine.borrow().stop_reasons.get(&ptid).copied();

                match reason {
                    Some(StopReason::Watchpoint(_)) => Ok(StopExplanation::Watchpoint),

                    Some(StopReason::Breakpoint) => {
                        let loc = (aspace.0, pc);

                        if state.registered.contains(&loc) {
                            Ok(StopExplanation::Breakpoint)
                        } else if Self::has_resume_at(&state, aspace.0, pc) {
                            // engine-owned; the engine matches the PC itself
                            Ok(StopExplanation::None)
                        } else if state.moribund.contains(&loc) {
                            Ok(StopExplanation::Moribund)
                        } else {
                            Ok(StopExplanation::None)
                        }
                    }

                    _ => Ok(StopExplanation::None),
                }
            }

            _ => Ok(StopExplanation::None),
        }
    }

    fn breakpoint_here(&self, aspace: AspaceId, pc: u64) -> Result<BreakpointHere, Self::Error> {
        let state = self.state.borrow();
        let loc = (aspace.0, pc);

        if state.registered.contains(&loc) && !state.suppressed.contains(&aspace.0) {
            return Ok(BreakpointHere::Ordinary);
        }

        if Self::has_resume_at(&state, aspace.0, pc) {
            return Ok(BreakpointHere::Ordinary);
        }

        Ok(BreakpointHere::None)
    }

    fn remove_at(&mut self, aspace: AspaceId, addr: u64) -> Result<(), Self::Error> {
        self.machine.borrow_mut().remove_trap(aspace.0, addr);
        Ok(())
    }

    fn insert_all(&mut self, skip: Option<(AspaceId, u64)>) -> Result<(), Self::Error> {
        let state = self.state.borrow();
        let mut machine = self.machine.borrow_mut();

        for &(space, addr) in &state.registered {
            if state.suppressed.contains(&space) {
                continue;
            }
            if skip.is_some_and(|(a, s)| (a.0, s) == (space, addr)) {
                continue;
            }
            machine.insert_trap(space, addr);
        }

        Ok(())
    }

    fn remove_all(&mut self) -> Result<(), Self::Error> {
        let state = self.state.borrow();
        let mut machine = self.machine.borrow_mut();

        for &(space, addr) in &state.registered {
            if !Self::has_resume_at(&state, space, addr) {
                machine.remove_trap(space, addr);
            }
        }

        Ok(())
    }

    fn suppress_in(&mut self, pspace: PspaceId) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        state.suppressed.insert(pspace.0);

        let mut machine = self.machine.borrow_mut();
        for &(space, addr) in &state.registered {
            if space == pspace.0 {
                machine.remove_trap(space, addr);
            }
        }

        Ok(())
    }

    fn reapply_to(&mut self, pspace: PspaceId) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        state.suppressed.remove(&pspace.0);

        let mut machine = self.machine.borrow_mut();
        for &(space, addr) in &state.registered {
            if space == pspace.0 {
                machine.insert_trap(space, addr);
            }
        }

        Ok(())
    }

    fn insert_resume(&mut self, aspace: AspaceId, addr: u64) -> Result<ResumeBpId, Self::Error> {
        let mut state = self.state.borrow_mut();

        state.next_resume += 1;
        let id = state.next_resume;
        state.resume.insert(id, (aspace.0, addr));

        self.machine.borrow_mut().insert_trap(aspace.0, addr);

        Ok(ResumeBpId(id))
    }

    fn remove_resume(&mut self, id: ResumeBpId) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();

        let Some((space, addr)) = state.resume.remove(&id.0) else {
            return Ok(());
        };

        // a registered breakpoint may share the location; its trap stays
        let shared = state.registered.contains(&(space, addr)) && !state.suppressed.contains(&space);
        if !shared && !Self::has_resume_at(&state, space, addr) {
            self.machine.borrow_mut().remove_trap(space, addr);
        }

        Ok(())
    }

    fn line_placement(&self, aspace: AspaceId, pc: u64) -> Result<LinePlacement, Self::Error> {
        let state = self.state.borrow();

        for entry in &state.lines {
            if entry.space == aspace.0 && (entry.start..entry.end).contains(&pc) {
                return Ok(entry.placement);
            }
        }

        // by default every instruction is its own line
        let start = pc - pc % INSN_LEN;
        Ok(LinePlacement::Line {
            start,
            end: start + INSN_LEN,
        })
    }
}
