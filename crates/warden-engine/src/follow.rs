use crate::breakpoints::Breakpoints;
use crate::control::RunControl;
use crate::error::{BreakpointsError, TargetError};
use crate::inferior::InferiorId;
use crate::ptid::Ptid;
use crate::settings::{FollowExec, FollowFork};
use crate::target::Target;
use crate::thread::Thread;

impl<T: Target, B: Breakpoints> RunControl<T, B> {
    /// Restructures process state after a fork or vfork of `parent`.
    ///
    /// Returns the thread the debugger stays with.
    #[tracing::instrument(name = "FollowFork", skip(self), fields(%parent, %child, vfork))]
    pub(crate) fn follow_fork(
        &mut self,
        parent: Ptid,
        child: Ptid,
        vfork: bool,
    ) -> crate::Result<Ptid, T::Error, B::Error> {
        let parent_inferior = self.threads[&parent].inferior;
        let follow_child = self.settings.follow_fork == FollowFork::Child;
        let detach_other = self.settings.detach_fork;

        // the child only becomes an inferior if we keep it; an unfollowed
        // vfork child is never kept, since the two sides share one address
        // space and holding both under control at once is refused
        let keep_child = !follow_child && !detach_other && !vfork;
        let child_inferior = if follow_child || keep_child {
            Some(self.add_fork_child(child)?)
        } else {
            None
        };

        if vfork {
            // parent and child share one address space until the child
            // execs or exits; the parent is held by the OS meanwhile
            let pspace = self.inferiors[&parent_inferior].pspace;

            if let Some(child_id) = child_inferior {
                self.inferiors[&parent_inferior].vfork_child = Some(child_id);
                self.inferiors[&child_id].vfork_parent = Some(parent_inferior);
            }

            self.inferiors[&parent_inferior].thread_waiting_for_vfork_done = Some(parent);

            if !self.inferiors[&parent_inferior].breakpoints_suppressed {
                // the child would trip over breakpoints meant for the
                // grown-up parent image
                self.breakpoints
                    .suppress_in(pspace)
                    .map_err(BreakpointsError)?;
                self.inferiors[&parent_inferior].breakpoints_suppressed = true;
            }
        }

        if follow_child {
            if detach_other {
                if vfork {
                    // the parent cannot be let go while the child borrows
                    // its address space; detach once vfork-done fires
                    self.inferiors[&parent_inferior].detach_on_vfork_done = true;
                } else {
                    self.detach_fork_branch(parent_inferior)?;
                }
            }

            tracing::info!(%child, "following fork child");
            return Ok(child);
        }

        if child_inferior.is_none() {
            tracing::info!(%child, "detaching unfollowed fork child");
            self.target.detach(child.pid).map_err(TargetError)?;
        } else {
            tracing::info!(%child, "keeping unfollowed fork child stopped");
        }

        Ok(parent)
    }

    /// Creates the inferior and main thread of a fresh fork child.
    fn add_fork_child(&mut self, child: Ptid) -> crate::Result<InferiorId, T::Error, B::Error> {
        let id = self.create_inferior(child.pid, &[])?;
        self.threads.insert(child, Thread::new(child, id));
        Ok(id)
    }

    /// Detaches an inferior that was the unfollowed branch of a fork.
    ///
    /// Nothing of it can be mid-step-over: it never ran under this engine.
    fn detach_fork_branch(&mut self, id: InferiorId) -> crate::Result<(), T::Error, B::Error> {
        let pid = self.inferiors[&id].pid;

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

        tracing::info!(pid, "unfollowed branch detached");

        Ok(())
    }

    /// Restructures process state after the given thread's process exec'd.
    ///
    /// Returns the (possibly re-homed) event thread.
    #[tracing::instrument(name = "FollowExec", skip(self), fields(%ptid, image))]
    pub(crate) fn follow_exec(
        &mut self,
        ptid: Ptid,
        image: &str,
    ) -> crate::Result<Ptid, T::Error, B::Error> {
        let inferior_id = self.threads[&ptid].inferior;
        let old_aspace = self.inferiors[&inferior_id].aspace;

        // an exec'ing vfork child releases its parent implicitly
        if self.inferiors[&inferior_id].vfork_parent.is_some() {
            self.release_vfork_parent_of(inferior_id)?;
        }

        // the OS image replacement destroyed every other thread
        let others: Vec<Ptid> = self
            .threads
            .values()
            .filter(|t| t.inferior == inferior_id && t.ptid() != ptid)
            .map(Thread::ptid)
            .collect();
        for other in others {
            self.delete_thread(other)?;
        }

        // stale per-thread step state dies with the old image
        if let Some((id, _)) = self.threads[&ptid].step_resume.take() {
            self.breakpoints.remove_resume(id).map_err(BreakpointsError)?;
        }
        self.threads[&ptid].clear_step_state();
        self.threads[&ptid].stop_pc = None;
        self.threads[&ptid].stopped_by_watchpoint = false;

        self.invalidate_displaced_on_exec(inferior_id);

        let pid = self.inferiors[&inferior_id].pid;
        let home = match self.settings.follow_exec {
            FollowExec::Same => {
                // reuse the inferior, but its image-derived state is stale
                let (aspace, pspace) = self.target.spaces(pid).map_err(TargetError)?;
                let arch = self.target.arch(pid).map_err(TargetError)?;
                let buffers = self
                    .target
                    .displaced_step_buffers(pid)
                    .map_err(TargetError)?;

                let inferior = &mut self.inferiors[&inferior_id];
                inferior.aspace = aspace;
                inferior.pspace = pspace;
                inferior.arch = arch;
                inferior.reset_scratch(buffers);

                inferior_id
            }
            FollowExec::New => {
                // a fresh inferior takes over; the old one stays, empty
                let new_id = self.create_inferior(pid, &[])?;
                self.threads[&ptid].inferior = new_id;
                new_id
            }
        };

        let pspace = self.inferiors[&home].pspace;

        // stale-trap bookkeeping is meaningless against the old image
        self.moribund_hits.retain(|&(a, _), _| a != old_aspace);

        self.breakpoints
            .reapply_to(pspace)
            .map_err(BreakpointsError)?;

        tracing::info!(image, "exec followed");

        Ok(ptid)
    }

    /// Handles an explicit vfork-done event for the given parent thread.
    pub(crate) fn on_vfork_done(&mut self, ptid: Ptid) -> crate::Result<(), T::Error, B::Error> {
        let inferior_id = self.threads[&ptid].inferior;

        if self.inferiors[&inferior_id]
            .thread_waiting_for_vfork_done
            .is_none()
        {
            // already released implicitly by the child's exec/exit
            return Ok(());
        }

        self.release_vfork(inferior_id)
    }

    /// Releases the vfork parent of the given child inferior.
    pub(crate) fn release_vfork_parent_of(
        &mut self,
        child: InferiorId,
    ) -> crate::Result<(), T::Error, B::Error> {
        let Some(parent) = self.inferiors[&child].vfork_parent else {
            return Ok(());
        };

        self.inferiors[&child].vfork_parent = None;
        self.release_vfork(parent)
    }

    /// Ends a vfork shared-memory window on the parent side: edges cleared,
    /// breakpoints re-insertable, parent free to run again.
    fn release_vfork(&mut self, parent: InferiorId) -> crate::Result<(), T::Error, B::Error> {
        let inferior = &mut self.inferiors[&parent];

        let child = inferior.vfork_child.take();
        let waiting = inferior.thread_waiting_for_vfork_done.take();
        let pspace = inferior.pspace;
        let suppressed = std::mem::take(&mut inferior.breakpoints_suppressed);
        let detach_parent = std::mem::take(&mut inferior.detach_on_vfork_done);

        if let Some(child_id) = child {
            if let Some(child_inferior) = self.inferiors.get_mut(&child_id) {
                child_inferior.vfork_parent = None;
            }
        }

        if suppressed {
            self.breakpoints
                .reapply_to(pspace)
                .map_err(BreakpointsError)?;
        }

        tracing::info!(%parent, "vfork window closed");

        if detach_parent {
            return self.detach_fork_branch(parent);
        }

        // let the parent pick its journey back up if it was meant to run
        if let Some(waiting) = waiting {
            let resumable = self
                .threads
                .get(&waiting)
                .is_some_and(|t| t.is_stopped() && t.pending.is_none());
            let wanted = self.command.is_some_and(|c| {
                self.compute_scope(c.ptid, c.stepping).contains(waiting)
            });

            if resumable && wanted {
                self.keep_going(waiting)?;
            }
        }

        Ok(())
    }
}
