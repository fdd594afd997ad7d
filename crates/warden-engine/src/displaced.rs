use crate::breakpoints::Breakpoints;
use crate::control::RunControl;
use crate::error::TargetError;
use crate::inferior::InferiorId;
use crate::ptid::Ptid;
use crate::status::WaitStatus;
use crate::target::Target;
use crate::thread::DisplacedStep;

/// Result of trying to set up a displaced step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PrepareStatus {
    /// The thread's PC now points at the relocated copy; single-step it.
    Prepared(u64),

    /// No scratch slot (or a precondition) is available right now; try
    /// again once one frees up.
    Unavailable,

    /// This thread cannot be displaced-stepped; step it in-line instead.
    Cant,
}

/// Result of tearing down a displaced step after a stop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FinishStatus {
    /// The relocated copy executed and state was fixed up in place.
    Completed,

    /// A different trap intervened before the copy executed; the thread is
    /// back at the original PC.
    NotExecuted,
}

impl<T: Target, B: Breakpoints> RunControl<T, B> {
    /// Sets a thread up to execute a relocated copy of the instruction it
    /// stands on.
    ///
    /// Preconditions: no status is pending for the thread (a pending signal
    /// makes the completion trap ambiguous), and the thread is not a vfork
    /// parent waiting on its child.
    pub(crate) fn displaced_prepare(
        &mut self,
        ptid: Ptid,
    ) -> crate::Result<PrepareStatus, T::Error, B::Error> {
        let thread = &self.threads[&ptid];
        let inferior_id = thread.inferior;
        let inferior = &self.inferiors[&inferior_id];

        if thread.pending.is_some()
            || inferior.thread_waiting_for_vfork_done == Some(ptid)
            || inferior.displaced_disabled
        {
            return Ok(PrepareStatus::Unavailable);
        }

        let Some(pc) = thread.stop_pc else {
            return Ok(PrepareStatus::Unavailable);
        };

        let Some(slot) = inferior
            .scratch
            .iter()
            .position(|s| s.occupied_by.is_none())
        else {
            return Ok(PrepareStatus::Unavailable);
        };
        let scratch_pc = inferior.scratch[slot].buffer.addr;

        let relocation = match self.target.relocate_instruction(ptid, pc, scratch_pc) {
            Ok(Some(relocation)) => relocation,
            Ok(None) => {
                // this particular instruction can't be relocated; in-line
                // stepping still works for the rest of the process
                tracing::debug!(%ptid, pc = format_args!("{pc:#x}"), "instruction not relocatable");
                return Ok(PrepareStatus::Cant);
            }
            Err(e) => {
                self.disable_displaced(inferior_id, &e);
                return Ok(PrepareStatus::Cant);
            }
        };

        let mut saved = vec![0u8; relocation.insn.len()];
        let setup = self
            .target
            .read_memory(ptid, scratch_pc, &mut saved)
            .and_then(|()| self.target.write_memory(ptid, scratch_pc, &relocation.insn))
            .and_then(|()| self.target.write_pc(ptid, scratch_pc));

        if let Err(e) = setup {
            self.disable_displaced(inferior_id, &e);
            return Ok(PrepareStatus::Cant);
        }

        self.inferiors[&inferior_id].scratch[slot].occupied_by = Some(ptid);
        self.threads[&ptid].displaced = Some(DisplacedStep {
            original_pc: pc,
            slot,
            scratch_pc,
            saved,
            relocation,
        });

        tracing::debug!(
            %ptid,
            from = format_args!("{pc:#x}"),
            to = format_args!("{scratch_pc:#x}"),
            "displaced step prepared"
        );

        Ok(PrepareStatus::Prepared(scratch_pc))
    }

    /// Tears down a thread's displaced step after any stop.
    ///
    /// The scratch slot's original bytes are always restored and the slot
    /// released; fix-up runs only if the relocated copy actually executed.
    /// For fork-family statuses the fixed-up PC is propagated into the new
    /// child, which started life with its PC inside the scratch buffer.
    pub(crate) fn displaced_finish(
        &mut self,
        ptid: Ptid,
        status: &WaitStatus,
    ) -> crate::Result<FinishStatus, T::Error, B::Error> {
        let Some(displaced) = self.threads[&ptid].displaced.take() else {
            return Err(crate::Error::Inconsistency(
                "displaced finish without a displaced step in progress",
            ));
        };

        let inferior_id = self.threads[&ptid].inferior;

        self.target
            .write_memory(ptid, displaced.scratch_pc, &displaced.saved)
            .map_err(TargetError)?;
        self.release_scratch_slot(inferior_id, displaced.slot);

        let pc = self.target.read_pc(ptid).map_err(TargetError)?;
        let executed = pc != displaced.scratch_pc;

        if !executed {
            self.target
                .write_pc(ptid, displaced.original_pc)
                .map_err(TargetError)?;

            tracing::debug!(%ptid, "relocated instruction did not execute");

            return Ok(FinishStatus::NotExecuted);
        }

        self.target
            .fixup_displaced(
                ptid,
                &displaced.relocation,
                displaced.original_pc,
                displaced.scratch_pc,
            )
            .map_err(TargetError)?;

        if let Some(child) = status.forked_child() {
            // the child's clone of the registers still points into the
            // scratch buffer; give it the fixed-up PC as well
            let parent_pc = self.target.read_pc(ptid).map_err(TargetError)?;
            self.target
                .write_pc(child, parent_pc)
                .map_err(TargetError)?;

            tracing::debug!(%child, pc = format_args!("{parent_pc:#x}"), "propagated fixup to child");
        }

        tracing::debug!(%ptid, "displaced step completed");

        Ok(FinishStatus::Completed)
    }

    /// Permanently downgrades an inferior to in-line stepping.
    pub(crate) fn disable_displaced(&mut self, id: InferiorId, error: &T::Error) {
        let inferior = &mut self.inferiors[&id];

        if !inferior.displaced_disabled {
            tracing::warn!(%id, %error, "displaced stepping disabled for this process");
            inferior.displaced_disabled = true;
        }
    }

    /// Drops every displaced step of an inferior without touching memory.
    ///
    /// Used on exec: the scratch buffer bytes belong to the replaced image
    /// and must never be referenced again.
    pub(crate) fn invalidate_displaced_on_exec(&mut self, id: InferiorId) {
        for thread in self.threads.values_mut() {
            if thread.inferior == id && thread.displaced.take().is_some() {
                tracing::debug!(ptid = %thread.ptid(), "displaced step invalidated by exec");
            }
        }

        for slot in &mut self.inferiors[&id].scratch {
            slot.occupied_by = None;
        }
    }
}
