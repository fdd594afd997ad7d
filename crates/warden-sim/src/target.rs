use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use warden_engine::ptid::{Ptid, ResumeScope};
use warden_engine::sig::Sig;
use warden_engine::status::WaitStatus;
use warden_engine::target::{ArchInfo, Relocation, ScratchBuffer, Target};
use warden_engine::{AspaceId, PspaceId};

use crate::error::SimError;
use crate::machine::{Inner, StopReason, INSN_LEN};

/// Event-source side of a [SimMachine](crate::SimMachine).
#[derive(Clone)]
pub struct SimTarget {
    inner: Rc<RefCell<Inner>>,
}

impl SimTarget {
    pub(crate) fn new(inner: Rc<RefCell<Inner>>) -> Self {
        Self { inner }
    }
}

impl Target for SimTarget {
    type Error = SimError;

    fn resume(&mut self, scope: ResumeScope, step: bool, sig: Sig) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();

        let targets: Vec<Ptid> = inner
            .procs
            .iter()
            .filter(|(_, p)| !p.detached)
            .flat_map(|(&pid, p)| p.threads.keys().map(move |&tid| Ptid::new(pid, tid)))
            .filter(|&ptid| scope.contains(ptid))
            .collect();

        if targets.is_empty() {
            if let ResumeScope::Thread(ptid) = scope {
                return Err(SimError::UnknownThread(ptid));
            }
        }

        for ptid in targets {
            let thread = inner.thread_mut(ptid)?;
            thread.running = true;
            thread.single_step = step;
            inner.stop_reasons.remove(&ptid);

            if sig != Sig::NONE {
                inner.delivered.push((ptid, sig));
            }
        }

        Ok(())
    }

    fn wait(
        &mut self,
        scope: ResumeScope,
        non_blocking: bool,
    ) -> impl Future<Output = Result<Option<(Ptid, WaitStatus)>, Self::Error>> {
        let result = self.inner.borrow_mut().wait_sync(scope, non_blocking);
        async move { result }
    }

    fn request_stop(&mut self, ptid: Ptid) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();

        let running = inner.thread(ptid).map(|t| t.running).unwrap_or(false);
        if running {
            inner.stop_thread(ptid, StopReason::StopRequest, WaitStatus::Stopped(Sig::STOP));
        }

        Ok(())
    }

    fn thread_events(&mut self, enable: bool) -> Result<(), Self::Error> {
        self.inner.borrow_mut().thread_events = enable;
        Ok(())
    }

    fn detach(&mut self, pid: i32) -> Result<(), Self::Error> {
        self.inner.borrow_mut().detach(pid)
    }

    fn live_threads(&mut self, pid: i32) -> Result<Vec<Ptid>, Self::Error> {
        let inner = self.inner.borrow();

        Ok(inner
            .procs
            .get(&pid)
            .filter(|p| !p.detached)
            .map(|p| p.threads.keys().map(|&tid| Ptid::new(pid, tid)).collect())
            .unwrap_or_default())
    }

    fn supports_non_stop(&self) -> bool {
        true
    }

    fn supports_multi_process(&self) -> bool {
        true
    }

    fn supports_displaced_step(&self, _ptid: Ptid) -> bool {
        self.inner.borrow().displaced_supported
    }

    fn steppable_watchpoints(&self) -> bool {
        false
    }

    fn record_is_replaying(&self, _ptid: Ptid) -> bool {
        false
    }

    fn spaces(&mut self, pid: i32) -> Result<(AspaceId, PspaceId), Self::Error> {
        let space = self.inner.borrow().proc_space(pid)?;
        Ok((AspaceId(space), PspaceId(space)))
    }

    fn arch(&mut self, pid: i32) -> Result<ArchInfo, Self::Error> {
        self.inner.borrow().proc_space(pid)?;

        Ok(ArchInfo {
            decr_pc_after_break: 0,
            breakpoint_len: 1,
            max_insn_len: INSN_LEN,
        })
    }

    fn read_memory(&mut self, ptid: Ptid, addr: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        let inner = self.inner.borrow();
        let space = inner.proc_space(ptid.pid)?;

        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = inner.shadow_byte(space, addr + i as u64);
        }

        Ok(())
    }

    fn write_memory(&mut self, ptid: Ptid, addr: u64, buf: &[u8]) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        let space = inner.proc_space(ptid.pid)?;

        for (i, &byte) in buf.iter().enumerate() {
            inner.poke(space, addr + i as u64, byte);
        }
        inner.write_log.push((addr, buf.len()));

        Ok(())
    }

    fn read_pc(&mut self, ptid: Ptid) -> Result<u64, Self::Error> {
        self.inner.borrow().thread(ptid).map(|t| t.pc)
    }

    fn write_pc(&mut self, ptid: Ptid, pc: u64) -> Result<(), Self::Error> {
        self.inner.borrow_mut().thread_mut(ptid)?.pc = pc;
        Ok(())
    }

    fn return_address(&mut self, _ptid: Ptid) -> Result<Option<u64>, Self::Error> {
        // the machine has no call stack
        Ok(None)
    }

    fn displaced_step_buffers(&mut self, pid: i32) -> Result<Vec<ScratchBuffer>, Self::Error> {
        let inner = self.inner.borrow();
        inner
            .procs
            .get(&pid)
            .map(|p| p.scratch.clone())
            .ok_or(SimError::UnknownProcess(pid))
    }

    fn relocate_instruction(
        &mut self,
        ptid: Ptid,
        from: u64,
        _to: u64,
    ) -> Result<Option<Relocation>, Self::Error> {
        let inner = self.inner.borrow();
        let space = inner.proc_space(ptid.pid)?;

        let mut insn = vec![0u8; INSN_LEN as usize];
        for (i, byte) in insn.iter_mut().enumerate() {
            *byte = inner.shadow_byte(space, from + i as u64);
        }

        // instructions are position-independent; copying them is enough
        Ok(Some(Relocation { insn, payload: 0 }))
    }

    fn fixup_displaced(
        &mut self,
        ptid: Ptid,
        _relocation: &Relocation,
        from: u64,
        to: u64,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        let thread = inner.thread_mut(ptid)?;

        // a straight-line instruction fell off the end of the copy; a jump
        // already landed at its absolute destination
        if thread.pc == to + INSN_LEN {
            thread.pc = from + INSN_LEN;
        }

        Ok(())
    }
}
