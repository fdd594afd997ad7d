use std::future::Future;

use crate::inferior::{AspaceId, PspaceId};
use crate::ptid::{Ptid, ResumeScope};
use crate::sig::Sig;
use crate::status::WaitStatus;

/// Architecture description of a debuggee process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchInfo {
    /// How far the PC sits past a break instruction when a breakpoint trap
    /// is reported, if the backend does not already rewind it.
    pub decr_pc_after_break: u64,

    /// Length of the break instruction, in bytes.
    pub breakpoint_len: u64,

    /// Upper bound on the length of any instruction, in bytes.
    pub max_insn_len: u64,
}

/// One scratch slot usable for displaced stepping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchBuffer {
    /// Start address of the slot in the debuggee's address space.
    pub addr: u64,

    /// Slot length, in bytes.
    pub len: u64,
}

/// Backend-produced description of a relocated instruction.
///
/// Produced by [Target::relocate_instruction] and handed back unchanged to
/// [Target::fixup_displaced] once the relocated copy has executed. The
/// engine only writes `insn` into the scratch slot; `payload` is private to
/// the backend.
#[derive(Clone, Debug)]
pub struct Relocation {
    /// Bytes to write into the scratch slot.
    pub insn: Vec<u8>,

    /// Backend-private fixup payload.
    pub payload: u64,
}

/// Trait implementing the event source and low-level control of a debuggee.
///
/// Implementors turn OS primitives (trace syscalls, exception ports, /proc)
/// into normalized [WaitStatus] events and carry out resume/stop requests.
/// One implementation exists per backend; the engine queries capabilities
/// explicitly instead of assuming any of the optional ones.
pub trait Target {
    /// Error returned by this trait.
    type Error: std::error::Error;

    /// Lets the named scope run, optionally single-stepping, optionally
    /// delivering a signal ([Sig::NONE] for none).
    fn resume(&mut self, scope: ResumeScope, step: bool, sig: Sig) -> Result<(), Self::Error>;

    /// Returns the next debug event within the given scope.
    ///
    /// With `non_blocking` set, returns `None` when no event is ready
    /// instead of waiting for one.
    fn wait(
        &mut self,
        scope: ResumeScope,
        non_blocking: bool,
    ) -> impl Future<Output = Result<Option<(Ptid, WaitStatus)>, Self::Error>>;

    /// Asks the given thread to stop, best-effort and asynchronous.
    ///
    /// The stop materializes later as a [WaitStatus::Stopped] event.
    fn request_stop(&mut self, ptid: Ptid) -> Result<(), Self::Error>;

    /// Toggles reporting of thread-create/clone/exit events.
    fn thread_events(&mut self, enable: bool) -> Result<(), Self::Error>;

    /// Detaches from the given process, letting it run free.
    fn detach(&mut self, pid: i32) -> Result<(), Self::Error>;

    /// Returns the threads currently alive in the given process.
    fn live_threads(&mut self, pid: i32) -> Result<Vec<Ptid>, Self::Error>;

    /// Whether threads can be stopped and resumed individually.
    fn supports_non_stop(&self) -> bool;

    /// Whether more than one process can be controlled at a time.
    fn supports_multi_process(&self) -> bool;

    /// Whether the given thread can execute relocated instructions out of a
    /// scratch buffer.
    fn supports_displaced_step(&self, ptid: Ptid) -> bool;

    /// Whether the target can single-step a thread past a watchpoint
    /// natively.
    fn steppable_watchpoints(&self) -> bool;

    /// Whether the given thread is replaying recorded execution.
    fn record_is_replaying(&self, ptid: Ptid) -> bool;

    /// Returns the address-space and program-space identifiers of the given
    /// process.
    ///
    /// A vfork child reports its parent's identifiers until it execs or
    /// exits.
    fn spaces(&mut self, pid: i32) -> Result<(AspaceId, PspaceId), Self::Error>;

    /// Returns the architecture description of the given process.
    fn arch(&mut self, pid: i32) -> Result<ArchInfo, Self::Error>;

    /// Reads data from the debuggee's address space.
    ///
    /// Inserted breakpoints are shadowed: reads covering one return the
    /// original instruction bytes.
    fn read_memory(&mut self, ptid: Ptid, addr: u64, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes data to the debuggee's address space.
    fn write_memory(&mut self, ptid: Ptid, addr: u64, buf: &[u8]) -> Result<(), Self::Error>;

    /// Reads the given thread's program counter.
    fn read_pc(&mut self, ptid: Ptid) -> Result<u64, Self::Error>;

    /// Writes the given thread's program counter.
    fn write_pc(&mut self, ptid: Ptid, pc: u64) -> Result<(), Self::Error>;

    /// Returns the return address of the frame the given thread stands in,
    /// if one can be computed.
    fn return_address(&mut self, ptid: Ptid) -> Result<Option<u64>, Self::Error>;

    /// Returns the scratch slots usable for displaced-stepping threads of
    /// the given process.
    ///
    /// Their validity ends when the process execs; the engine re-reads them
    /// afterwards.
    fn displaced_step_buffers(&mut self, pid: i32) -> Result<Vec<ScratchBuffer>, Self::Error>;

    /// Relocates the instruction at `from` so it can execute at `to`,
    /// adjusting PC-relative operands as needed.
    ///
    /// Returns `None` when this particular instruction cannot be relocated;
    /// an `Err` means the process cannot displaced-step at all.
    fn relocate_instruction(
        &mut self,
        ptid: Ptid,
        from: u64,
        to: u64,
    ) -> Result<Option<Relocation>, Self::Error>;

    /// Restores the register/memory state of a thread that executed a
    /// relocated instruction at `to`, as if the original at `from` had run
    /// in place.
    fn fixup_displaced(
        &mut self,
        ptid: Ptid,
        relocation: &Relocation,
        from: u64,
        to: u64,
    ) -> Result<(), Self::Error>;
}
