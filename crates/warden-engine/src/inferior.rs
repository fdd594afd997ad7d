use crate::ptid::Ptid;
use crate::target::{ArchInfo, ScratchBuffer};

/// Identifier of one inferior (a debuggee process under control).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InferiorId(pub u32);

/// Identifier of an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AspaceId(pub u32);

/// Identifier of a program space (the image mapped into an address space).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PspaceId(pub u32);

impl core::fmt::Display for InferiorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "inferior {}", self.0)
    }
}

/// One displaced-step scratch slot and its current owner.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScratchSlot {
    /// Slot geometry, as reported by the target.
    pub buffer: ScratchBuffer,

    /// Thread currently executing out of this slot, if any.
    pub occupied_by: Option<Ptid>,
}

/// One debuggee process under control.
#[derive(Debug)]
pub struct Inferior {
    id: InferiorId,

    /// Process id.
    pub pid: i32,

    /// Address space this process executes in.
    pub aspace: AspaceId,

    /// Program space (image) mapped into the address space.
    pub pspace: PspaceId,

    /// Architecture description; re-read after exec.
    pub arch: ArchInfo,

    /// Parent of this inferior across a live vfork, if any.
    pub vfork_parent: Option<InferiorId>,

    /// Vfork child still borrowing this inferior's address space, if any.
    pub vfork_child: Option<InferiorId>,

    /// Thread whose vfork child still owns the shared address space.
    pub thread_waiting_for_vfork_done: Option<Ptid>,

    /// Breakpoint insertion is suppressed on this inferior's program space
    /// for the duration of a vfork shared-memory window.
    pub breakpoints_suppressed: bool,

    /// Displaced stepping proved unusable for this process; in-line
    /// stepping is used instead, permanently.
    pub displaced_disabled: bool,

    /// A detach of this inferior is underway.
    pub detaching: bool,

    /// This inferior is the unfollowed branch of a vfork and is detached
    /// once its child releases the shared address space.
    pub detach_on_vfork_done: bool,

    /// The next stop of this inferior surfaces regardless of signal
    /// policy (quiet startup).
    pub stop_soon: bool,

    /// Scratch slots for displaced stepping.
    pub(crate) scratch: Vec<ScratchSlot>,
}

impl Inferior {
    pub(crate) fn new(
        id: InferiorId,
        pid: i32,
        aspace: AspaceId,
        pspace: PspaceId,
        arch: ArchInfo,
        buffers: Vec<ScratchBuffer>,
    ) -> Self {
        Self {
            id,
            pid,
            aspace,
            pspace,
            arch,
            vfork_parent: None,
            vfork_child: None,
            thread_waiting_for_vfork_done: None,
            breakpoints_suppressed: false,
            displaced_disabled: false,
            detaching: false,
            detach_on_vfork_done: false,
            stop_soon: false,
            scratch: buffers
                .into_iter()
                .map(|buffer| ScratchSlot {
                    buffer,
                    occupied_by: None,
                })
                .collect(),
        }
    }

    /// Returns this inferior's identifier.
    pub fn id(&self) -> InferiorId {
        self.id
    }

    /// Returns how many displaced steps are in progress in this process.
    pub fn displaced_in_progress(&self) -> usize {
        self.scratch
            .iter()
            .filter(|slot| slot.occupied_by.is_some())
            .count()
    }

    /// Returns whether this inferior is on either side of a live vfork.
    pub fn vfork_in_progress(&self) -> bool {
        self.vfork_parent.is_some() || self.vfork_child.is_some()
    }

    /// Replaces the scratch slots, invalidating previous occupancy.
    ///
    /// Used after exec: the old slots' bytes must never be referenced
    /// again.
    pub(crate) fn reset_scratch(&mut self, buffers: Vec<ScratchBuffer>) {
        self.scratch = buffers
            .into_iter()
            .map(|buffer| ScratchSlot {
                buffer,
                occupied_by: None,
            })
            .collect();
    }
}
