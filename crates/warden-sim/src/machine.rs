use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use indexmap::IndexMap;
use warden_engine::ptid::{Ptid, ResumeScope};
use warden_engine::sig::Sig;
use warden_engine::status::WaitStatus;
use warden_engine::target::ScratchBuffer;
use warden_engine::AspaceId;

use crate::breakpoints::SimBreakpoints;
use crate::error::SimError;
use crate::target::SimTarget;

/// Length of every encoded instruction, in bytes.
pub const INSN_LEN: u64 = 8;

/// Byte the breakpoint side plants over the first byte of an instruction.
pub const TRAP_BYTE: u8 = 0xCC;

/// Default displaced-stepping scratch slot installed in every process.
pub const SCRATCH_ADDR: u64 = 0xF000;

const SCRATCH_LEN: u64 = 16;
const MAX_WORLD_STEPS: usize = 100_000;

/// One instruction of the simulated machine.
///
/// Instructions are 8 bytes: an opcode byte, a 32-bit little-endian first
/// argument, a 16-bit second argument and a pad byte. Addresses must fit the
/// 32-bit argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Does nothing.
    Nop,

    /// Writes one byte of data.
    Store {
        /// Destination address.
        addr: u64,
        /// Byte written.
        val: u8,
    },

    /// Transfers control to an absolute address.
    Jump {
        /// Destination address.
        target: u64,
    },

    /// Forks a copy-on-write child process.
    ///
    /// The child starts at the next instruction slot and the parent skips
    /// over it, so the slot after a fork is the child's branch (typically a
    /// jump to its own code).
    Fork {
        /// Process id the child is created with.
        child: i32,
    },

    /// Vforks a child that borrows this process's address space; the caller
    /// is held until the child execs or exits. Branches like [Fork](Op::Fork).
    Vfork {
        /// Process id the child is created with.
        child: i32,
    },

    /// Replaces the process image with a registered one.
    Exec {
        /// Image id, as registered with the machine.
        image: u32,
    },

    /// Creates a new thread in the current process.
    Clone {
        /// Address the new thread starts executing at.
        start: u64,
        /// Thread id the new thread is created with.
        tid: u16,
    },

    /// Ends the calling thread; ends the process if it was the last one.
    ExitThread {
        /// Exit code.
        code: i32,
    },

    /// Ends the whole process.
    ExitProcess {
        /// Exit code.
        code: i32,
    },

    /// Raises a signal against the calling thread.
    Raise {
        /// Signal number raised.
        signo: i32,
    },
}

impl Op {
    fn encode(self) -> [u8; 8] {
        let (opcode, arg1, arg2): (u8, u32, u16) = match self {
            Self::Nop => (0, 0, 0),
            Self::Store { addr, val } => (1, addr as u32, u16::from(val)),
            Self::Jump { target } => (2, target as u32, 0),
            Self::Fork { child } => (3, child as u32, 0),
            Self::Vfork { child } => (4, child as u32, 0),
            Self::Exec { image } => (5, image, 0),
            Self::Clone { start, tid } => (6, start as u32, tid),
            Self::ExitThread { code } => (7, code as u32, 0),
            Self::ExitProcess { code } => (8, code as u32, 0),
            Self::Raise { signo } => (9, signo as u32, 0),
        };

        let mut bytes = [0u8; 8];
        bytes[0] = opcode;
        bytes[1..5].copy_from_slice(&arg1.to_le_bytes());
        bytes[5..7].copy_from_slice(&arg2.to_le_bytes());
        bytes
    }

    fn decode(bytes: [u8; 8]) -> Option<Self> {
        let arg1 = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let arg2 = u16::from_le_bytes([bytes[5], bytes[6]]);

        Some(match bytes[0] {
            0 => Self::Nop,
            1 => Self::Store {
                addr: u64::from(arg1),
                val: arg2 as u8,
            },
            2 => Self::Jump {
                target: u64::from(arg1),
            },
            3 => Self::Fork { child: arg1 as i32 },
            4 => Self::Vfork { child: arg1 as i32 },
            5 => Self::Exec { image: arg1 },
            6 => Self::Clone {
                start: u64::from(arg1),
                tid: arg2,
            },
            7 => Self::ExitThread { code: arg1 as i32 },
            8 => Self::ExitProcess { code: arg1 as i32 },
            9 => Self::Raise { signo: arg1 as i32 },
            _ => return None,
        })
    }
}

/// A small program laid out contiguously from a base address.
#[derive(Clone, Debug)]
pub struct Program {
    base: u64,
    ops: Vec<Op>,
}

impl Program {
    /// Creates an empty program starting at the given address.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            ops: Vec::new(),
        }
    }

    /// Appends an instruction.
    #[must_use]
    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    /// Returns the address of the instruction at the given index.
    pub fn addr(&self, index: usize) -> u64 {
        self.base + INSN_LEN * index as u64
    }

    /// Returns the program's entry point.
    pub fn entry(&self) -> u64 {
        self.base
    }

    fn load_into(&self, mem: &mut HashMap<u64, u8>) {
        for (i, op) in self.ops.iter().enumerate() {
            let base = self.addr(i);
            for (j, byte) in op.encode().iter().enumerate() {
                mem.insert(base + j as u64, *byte);
            }
        }
    }
}

/// Why a simulated thread last stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// It hit a planted trap byte before executing.
    Breakpoint,

    /// It executed a store covered by a watchpoint.
    Watchpoint(u64),

    /// It completed a single-step.
    SingleStep,

    /// It honored an asynchronous stop request.
    StopRequest,

    /// It raised (or faulted with) a signal.
    Signal,

    /// It reported a lifecycle event.
    Event,
}

pub(crate) struct SimThread {
    pub(crate) pc: u64,
    pub(crate) running: bool,
    pub(crate) single_step: bool,
}

pub(crate) struct Proc {
    pub(crate) space: u32,
    pub(crate) threads: IndexMap<i64, SimThread>,
    pub(crate) scratch: Vec<ScratchBuffer>,
    pub(crate) vfork_held: bool,
    pub(crate) vfork_parent: Option<Ptid>,
    pub(crate) detached: bool,
}

/// Shared mutable state of the machine.
pub(crate) struct Inner {
    pub(crate) spaces: HashMap<u32, HashMap<u64, u8>>,
    next_space: u32,
    pub(crate) procs: IndexMap<i32, Proc>,
    events: VecDeque<(Ptid, WaitStatus)>,
    images: HashMap<u32, (String, Program)>,

    /// Planted trap bytes, with the instruction byte each one shadows.
    pub(crate) inserted: HashMap<(u32, u64), u8>,
    pub(crate) watchpoints: HashSet<(u32, u64)>,

    pub(crate) thread_events: bool,
    pub(crate) displaced_supported: bool,

    pub(crate) delivered: Vec<(Ptid, Sig)>,
    pub(crate) write_log: Vec<(u64, usize)>,
    pub(crate) stop_reasons: HashMap<Ptid, StopReason>,
}

impl Inner {
    fn new() -> Self {
        Self {
            spaces: HashMap::new(),
            next_space: 0,
            procs: IndexMap::new(),
            events: VecDeque::new(),
            images: HashMap::new(),
            inserted: HashMap::new(),
            watchpoints: HashSet::new(),
            thread_events: false,
            displaced_supported: true,
            delivered: Vec::new(),
            write_log: Vec::new(),
            stop_reasons: HashMap::new(),
        }
    }

    fn alloc_space(&mut self) -> u32 {
        self.next_space += 1;
        self.spaces.insert(self.next_space, HashMap::new());
        self.next_space
    }

    fn clone_space(&mut self, space: u32) -> u32 {
        // clone the shadowed view: the child is born without trap bytes
        let addrs: Vec<u64> = self
            .spaces
            .get(&space)
            .map(|mem| mem.keys().copied().collect())
            .unwrap_or_default();

        let copy: HashMap<u64, u8> = addrs
            .into_iter()
            .map(|addr| (addr, self.shadow_byte(space, addr)))
            .collect();

        self.next_space += 1;
        self.spaces.insert(self.next_space, copy);
        self.next_space
    }

    pub(crate) fn raw_byte(&self, space: u32, addr: u64) -> u8 {
        self.spaces
            .get(&space)
            .and_then(|mem| mem.get(&addr))
            .copied()
            .unwrap_or(0)
    }

    /// Reads one byte with planted trap bytes shadowed away.
    pub(crate) fn shadow_byte(&self, space: u32, addr: u64) -> u8 {
        if let Some(&saved) = self.inserted.get(&(space, addr)) {
            return saved;
        }
        self.raw_byte(space, addr)
    }

    /// Writes one byte, preserving any trap byte planted on top of it.
    pub(crate) fn poke(&mut self, space: u32, addr: u64, byte: u8) {
        if let Some(saved) = self.inserted.get_mut(&(space, addr)) {
            *saved = byte;
        } else {
            self.spaces.entry(space).or_default().insert(addr, byte);
        }
    }

    pub(crate) fn insert_trap(&mut self, space: u32, addr: u64) {
        if self.inserted.contains_key(&(space, addr)) {
            return;
        }
        let saved = self.raw_byte(space, addr);
        self.inserted.insert((space, addr), saved);
        self.spaces.entry(space).or_default().insert(addr, TRAP_BYTE);
    }

    pub(crate) fn remove_trap(&mut self, space: u32, addr: u64) {
        if let Some(saved) = self.inserted.remove(&(space, addr)) {
            self.spaces.entry(space).or_default().insert(addr, saved);
        }
    }

    pub(crate) fn thread(&self, ptid: Ptid) -> Result<&SimThread, SimError> {
        self.procs
            .get(&ptid.pid)
            .and_then(|p| p.threads.get(&ptid.tid))
            .ok_or(SimError::UnknownThread(ptid))
    }

    pub(crate) fn thread_mut(&mut self, ptid: Ptid) -> Result<&mut SimThread, SimError> {
        self.procs
            .get_mut(&ptid.pid)
            .and_then(|p| p.threads.get_mut(&ptid.tid))
            .ok_or(SimError::UnknownThread(ptid))
    }

    pub(crate) fn proc_space(&self, pid: i32) -> Result<u32, SimError> {
        self.procs
            .get(&pid)
            .map(|p| p.space)
            .ok_or(SimError::UnknownProcess(pid))
    }

    fn set_pc(&mut self, ptid: Ptid, pc: u64) {
        if let Ok(thread) = self.thread_mut(ptid) {
            thread.pc = pc;
        }
    }

    pub(crate) fn stop_thread(&mut self, ptid: Ptid, reason: StopReason, status: WaitStatus) {
        if let Ok(thread) = self.thread_mut(ptid) {
            thread.running = false;
            thread.single_step = false;
        }
        self.stop_reasons.insert(ptid, reason);
        self.events.push_back((ptid, status));
    }

    fn process_exit(&mut self, pid: i32, ptid: Ptid, status: WaitStatus, debugged: bool) {
        let released = self.procs.get_mut(&pid).and_then(|p| p.vfork_parent.take());

        self.procs.shift_remove(&pid);
        self.stop_reasons.retain(|p, _| p.pid != pid);

        if let Some(parent) = released {
            self.vfork_release(parent);
        }

        if debugged {
            self.events.push_back((ptid, status));
        }
    }

    /// A vfork child gave the shared address space back; unblock the parent
    /// and tell its debugger, if it has one.
    fn vfork_release(&mut self, parent: Ptid) {
        let Some(proc) = self.procs.get_mut(&parent.pid) else {
            return;
        };

        proc.vfork_held = false;
        let detached = proc.detached;

        if let Some(thread) = proc.threads.get_mut(&parent.tid) {
            thread.running = false;
            thread.single_step = false;
        }

        if !detached {
            self.events.push_back((parent, WaitStatus::VforkDone));
        }
    }

    /// Executes one instruction of one thread. Returns whether the thread
    /// made progress (executed, trapped or died).
    fn step_thread(&mut self, pid: i32, tid: i64) -> bool {
        let Some(proc) = self.procs.get(&pid) else {
            return false;
        };
        if proc.vfork_held {
            return false;
        }
        let debugged = !proc.detached;

        let Some(thread) = proc.threads.get(&tid) else {
            return false;
        };
        if !thread.running {
            return false;
        }

        let (space, pc, single) = (proc.space, thread.pc, thread.single_step);
        let ptid = Ptid::new(pid, tid);

        // a planted trap fires before the instruction under it executes
        if debugged && self.inserted.contains_key(&(space, pc)) {
            self.stop_thread(ptid, StopReason::Breakpoint, WaitStatus::Stopped(Sig::TRAP));
            return true;
        }

        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.shadow_byte(space, pc + i as u64);
        }

        let Some(op) = Op::decode(bytes) else {
            if debugged {
                self.stop_thread(ptid, StopReason::Signal, WaitStatus::Stopped(Sig::ILL));
            } else {
                self.process_exit(pid, ptid, WaitStatus::Signalled(Sig::ILL), false);
            }
            return true;
        };

        self.execute(ptid, space, pc, op, debugged, single)
    }

    fn execute(
        &mut self,
        ptid: Ptid,
        space: u32,
        pc: u64,
        op: Op,
        debugged: bool,
        single: bool,
    ) -> bool {
        let (pid, tid) = (ptid.pid, ptid.tid);

        match op {
            Op::Nop => self.set_pc(ptid, pc + INSN_LEN),

            Op::Store { addr, val } => {
                self.poke(space, addr, val);
                self.set_pc(ptid, pc + INSN_LEN);

                if debugged && self.watchpoints.contains(&(space, addr)) {
                    self.stop_thread(
                        ptid,
                        StopReason::Watchpoint(addr),
                        WaitStatus::Stopped(Sig::TRAP),
                    );
                    return true;
                }
            }

            Op::Jump { target } => self.set_pc(ptid, target),

            Op::Fork { child } => {
                self.set_pc(ptid, pc + 2 * INSN_LEN);

                let child_space = self.clone_space(space);
                let scratch = self
                    .procs
                    .get(&pid)
                    .map(|p| p.scratch.clone())
                    .unwrap_or_default();

                let mut threads = IndexMap::new();
                threads.insert(
                    i64::from(child),
                    SimThread {
                        pc: pc + INSN_LEN,
                        running: !debugged,
                        single_step: false,
                    },
                );

                self.procs.insert(
                    child,
                    Proc {
                        space: child_space,
                        threads,
                        scratch,
                        vfork_held: false,
                        vfork_parent: None,
                        detached: !debugged,
                    },
                );

                if debugged {
                    self.stop_thread(ptid, StopReason::Event, WaitStatus::Forked(Ptid::main(child)));
                    return true;
                }
            }

            Op::Vfork { child } => {
                self.set_pc(ptid, pc + 2 * INSN_LEN);

                let scratch = self
                    .procs
                    .get(&pid)
                    .map(|p| p.scratch.clone())
                    .unwrap_or_default();

                let mut threads = IndexMap::new();
                threads.insert(
                    i64::from(child),
                    SimThread {
                        pc: pc + INSN_LEN,
                        running: !debugged,
                        single_step: false,
                    },
                );

                self.procs.insert(
                    child,
                    Proc {
                        space,
                        threads,
                        scratch,
                        vfork_held: false,
                        vfork_parent: Some(ptid),
                        detached: !debugged,
                    },
                );

                if let Some(parent) = self.procs.get_mut(&pid) {
                    parent.vfork_held = true;
                }

                if debugged {
                    self.stop_thread(
                        ptid,
                        StopReason::Event,
                        WaitStatus::Vforked(Ptid::main(child)),
                    );
                    return true;
                }
            }

            Op::Exec { image } => {
                let Some((name, program)) = self.images.get(&image) else {
                    if debugged {
                        self.stop_thread(ptid, StopReason::Signal, WaitStatus::Stopped(Sig::ILL));
                    } else {
                        self.process_exit(pid, ptid, WaitStatus::Signalled(Sig::ILL), false);
                    }
                    return true;
                };
                let (name, program) = (name.clone(), program.clone());

                let new_space = self.alloc_space();
                if let Some(mem) = self.spaces.get_mut(&new_space) {
                    program.load_into(mem);
                }

                let released = {
                    let Some(proc) = self.procs.get_mut(&pid) else {
                        return true;
                    };
                    proc.space = new_space;
                    proc.threads.retain(|&t, _| t == tid);
                    if let Some(thread) = proc.threads.get_mut(&tid) {
                        thread.pc = program.entry();
                        thread.single_step = false;
                    }
                    proc.vfork_parent.take()
                };

                self.stop_reasons
                    .retain(|p, _| p.pid != pid || p.tid == tid);

                if let Some(parent) = released {
                    self.vfork_release(parent);
                }

                if debugged {
                    self.stop_thread(ptid, StopReason::Event, WaitStatus::Execd(name));
                }
                return true;
            }

            Op::Clone { start, tid: new } => {
                self.set_pc(ptid, pc + INSN_LEN);

                let report = debugged && self.thread_events;
                if let Some(proc) = self.procs.get_mut(&pid) {
                    proc.threads.insert(
                        i64::from(new),
                        SimThread {
                            pc: start,
                            running: !report,
                            single_step: false,
                        },
                    );
                }

                if report {
                    self.stop_thread(
                        ptid,
                        StopReason::Event,
                        WaitStatus::ThreadCreated(Ptid::new(pid, i64::from(new))),
                    );
                    return true;
                }
            }

            Op::ExitThread { code } => {
                let last = {
                    let Some(proc) = self.procs.get_mut(&pid) else {
                        return true;
                    };
                    proc.threads.shift_remove(&tid);
                    proc.threads.is_empty()
                };
                self.stop_reasons.remove(&ptid);

                if last {
                    self.process_exit(pid, ptid, WaitStatus::Exited(code), debugged);
                } else if debugged && self.thread_events {
                    self.events.push_back((ptid, WaitStatus::ThreadExited(code)));
                }
                return true;
            }

            Op::ExitProcess { code } => {
                self.process_exit(pid, ptid, WaitStatus::Exited(code), debugged);
                return true;
            }

            Op::Raise { signo } => {
                self.set_pc(ptid, pc + INSN_LEN);
                if debugged {
                    self.stop_thread(ptid, StopReason::Signal, WaitStatus::Stopped(Sig(signo)));
                    return true;
                }
            }
        }

        if debugged && single {
            let still_running = self
                .procs
                .get(&pid)
                .and_then(|p| p.threads.get(&tid))
                .is_some_and(|t| t.running);

            if still_running {
                self.stop_thread(ptid, StopReason::SingleStep, WaitStatus::Stopped(Sig::TRAP));
            }
        }

        true
    }

    fn runnable(&self, detached: bool) -> Vec<(i32, i64)> {
        self.procs
            .iter()
            .filter(|(_, p)| p.detached == detached && !p.vfork_held)
            .flat_map(|(&pid, p)| {
                p.threads
                    .iter()
                    .filter(|(_, t)| t.running)
                    .map(move |(&tid, _)| (pid, tid))
            })
            .collect()
    }

    fn step_world(&mut self) -> bool {
        let mut progressed = false;
        for (pid, tid) in self.runnable(false) {
            progressed |= self.step_thread(pid, tid);
        }
        progressed
    }

    fn any_running(&self) -> bool {
        self.procs
            .iter()
            .filter(|(_, p)| !p.detached)
            .any(|(_, p)| p.threads.values().any(|t| t.running))
    }

    fn take_event(&mut self, scope: ResumeScope) -> Option<(Ptid, WaitStatus)> {
        let idx = self.events.iter().position(|(p, _)| scope.contains(*p))?;
        self.events.remove(idx)
    }

    /// Waits for the next event in scope, executing the machine as needed.
    pub(crate) fn wait_sync(
        &mut self,
        scope: ResumeScope,
        non_blocking: bool,
    ) -> Result<Option<(Ptid, WaitStatus)>, SimError> {
        if let Some(event) = self.take_event(scope) {
            return Ok(Some(event));
        }

        if non_blocking {
            return Ok(None);
        }

        for _ in 0..MAX_WORLD_STEPS {
            let progressed = self.step_world();

            if let Some(event) = self.take_event(scope) {
                return Ok(Some(event));
            }

            if !progressed {
                if self.any_running() || !self.events.is_empty() {
                    return Err(SimError::Deadlock);
                }
                return Ok(Some((Ptid::new(0, 0), WaitStatus::NoResumed)));
            }
        }

        Err(SimError::Runaway(MAX_WORLD_STEPS))
    }

    /// Lets every detached process run to completion (or quiescence).
    fn run_detached(&mut self) {
        for _ in 0..MAX_WORLD_STEPS {
            let runnable = self.runnable(true);
            if runnable.is_empty() {
                return;
            }

            let mut progressed = false;
            for (pid, tid) in runnable {
                progressed |= self.step_thread(pid, tid);
            }
            if !progressed {
                return;
            }
        }
    }

    pub(crate) fn detach(&mut self, pid: i32) -> Result<(), SimError> {
        {
            let proc = self
                .procs
                .get_mut(&pid)
                .ok_or(SimError::UnknownProcess(pid))?;
            proc.detached = true;
            for thread in proc.threads.values_mut() {
                thread.running = true;
                thread.single_step = false;
            }
        }

        self.events.retain(|(p, _)| p.pid != pid);
        self.stop_reasons.retain(|p, _| p.pid != pid);

        self.run_detached();
        Ok(())
    }
}

/// A deterministic simulated machine hosting one or more debuggee
/// processes.
///
/// Handles are cheap clones over shared state; [target](Self::target) and
/// [breakpoints](Self::breakpoints) produce the engine's two collaborators,
/// while the machine itself keeps the setup and inspection surface used by
/// tests.
#[derive(Clone)]
pub struct SimMachine {
    inner: Rc<RefCell<Inner>>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMachine {
    /// Creates an empty machine.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::new())),
        }
    }

    /// Returns the event-source side of this machine.
    pub fn target(&self) -> SimTarget {
        SimTarget::new(Rc::clone(&self.inner))
    }

    /// Returns a fresh breakpoint side over this machine.
    ///
    /// Each call starts with no breakpoints registered; clone the returned
    /// value to share one set of registrations between a test and the
    /// engine.
    pub fn breakpoints(&self) -> SimBreakpoints {
        SimBreakpoints::new(Rc::clone(&self.inner))
    }

    /// Creates a stopped process running the given program, with its main
    /// thread at the program's entry and one default scratch slot.
    pub fn spawn_process(&self, pid: i32, program: &Program) {
        let mut inner = self.inner.borrow_mut();

        let space = inner.alloc_space();
        if let Some(mem) = inner.spaces.get_mut(&space) {
            program.load_into(mem);
        }

        let mut threads = IndexMap::new();
        threads.insert(
            i64::from(pid),
            SimThread {
                pc: program.entry(),
                running: false,
                single_step: false,
            },
        );

        inner.procs.insert(
            pid,
            Proc {
                space,
                threads,
                scratch: vec![ScratchBuffer {
                    addr: SCRATCH_ADDR,
                    len: SCRATCH_LEN,
                }],
                vfork_held: false,
                vfork_parent: None,
                detached: false,
            },
        );
    }

    /// Adds a stopped thread to an existing process.
    pub fn add_thread(&self, pid: i32, tid: i64, pc: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(proc) = inner.procs.get_mut(&pid) {
            proc.threads.insert(
                tid,
                SimThread {
                    pc,
                    running: false,
                    single_step: false,
                },
            );
        }
    }

    /// Registers an image exec instructions can load.
    pub fn register_image(&self, id: u32, name: &str, program: &Program) {
        self.inner
            .borrow_mut()
            .images
            .insert(id, (name.to_owned(), program.clone()));
    }

    /// Replaces a process's scratch slots.
    pub fn set_scratch_slots(&self, pid: i32, slots: &[(u64, u64)]) {
        let mut inner = self.inner.borrow_mut();
        if let Some(proc) = inner.procs.get_mut(&pid) {
            proc.scratch = slots
                .iter()
                .map(|&(addr, len)| ScratchBuffer { addr, len })
                .collect();
        }
    }

    /// Toggles the displaced-stepping capability reported to the engine.
    pub fn set_displaced_supported(&self, supported: bool) {
        self.inner.borrow_mut().displaced_supported = supported;
    }

    /// Advances every running debugged thread by up to the given number of
    /// instructions, outside of any wait.
    ///
    /// Lets tests race state changes against threads already in flight, e.g.
    /// deleting a breakpoint after a thread has trapped on it but before the
    /// event is consumed.
    pub fn kick(&self, rounds: usize) {
        let mut inner = self.inner.borrow_mut();
        for _ in 0..rounds {
            if !inner.step_world() {
                break;
            }
        }
    }

    /// Returns the given thread's PC, if it is still alive.
    pub fn pc_of(&self, ptid: Ptid) -> Option<u64> {
        self.inner.borrow().thread(ptid).map(|t| t.pc).ok()
    }

    /// Reads one byte of a process's memory, trap bytes shadowed away.
    pub fn data_byte(&self, pid: i32, addr: u64) -> Option<u8> {
        let inner = self.inner.borrow();
        let space = inner.proc_space(pid).ok()?;
        Some(inner.shadow_byte(space, addr))
    }

    /// Reads one byte of a process's memory as the CPU would see it.
    pub fn raw_byte_at(&self, pid: i32, addr: u64) -> Option<u8> {
        let inner = self.inner.borrow();
        let space = inner.proc_space(pid).ok()?;
        Some(inner.raw_byte(space, addr))
    }

    /// Returns the address-space identifier of the given process.
    pub fn aspace_of(&self, pid: i32) -> Option<AspaceId> {
        self.inner.borrow().proc_space(pid).map(AspaceId).ok()
    }

    /// Returns whether the given process is still alive.
    pub fn process_exists(&self, pid: i32) -> bool {
        self.inner.borrow().procs.contains_key(&pid)
    }

    /// Returns whether the given thread is still alive.
    pub fn thread_exists(&self, ptid: Ptid) -> bool {
        self.inner.borrow().thread(ptid).is_ok()
    }

    /// Returns every signal delivered on a resume so far, in order.
    pub fn delivered_signals(&self) -> Vec<(Ptid, Sig)> {
        self.inner.borrow().delivered.clone()
    }

    /// Returns the `(address, length)` of every debugger memory write so
    /// far, in order.
    pub fn write_log(&self) -> Vec<(u64, usize)> {
        self.inner.borrow().write_log.clone()
    }

    /// Forgets the memory writes recorded so far.
    pub fn clear_write_log(&self) {
        self.inner.borrow_mut().write_log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Op, Program, INSN_LEN};

    #[test]
    fn opcodes_round_trip() {
        let ops = [
            Op::Nop,
            Op::Store { addr: 0x5000, val: 7 },
            Op::Jump { target: 0x3000 },
            Op::Fork { child: 2000 },
            Op::Vfork { child: 2001 },
            Op::Exec { image: 3 },
            Op::Clone { start: 0x4000, tid: 7 },
            Op::ExitThread { code: 0 },
            Op::ExitProcess { code: 1 },
            Op::Raise { signo: 14 },
        ];

        for op in ops {
            assert_eq!(Op::decode(op.encode()), Some(op));
        }
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut bytes = [0u8; 8];
        bytes[0] = 0xCC;
        assert_eq!(Op::decode(bytes), None);
    }

    #[test]
    fn program_layout() {
        let program = Program::new(0x1000).op(Op::Nop).op(Op::Nop);
        assert_eq!(program.entry(), 0x1000);
        assert_eq!(program.addr(1), 0x1000 + INSN_LEN);
    }
}
