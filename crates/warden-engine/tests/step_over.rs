// Once clippy takes `clippy.toml` into account (for `tests` targets), we can
// remove these.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::print_stdout)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

mod common;

use test_log::test;
use warden_engine::control::ProceedRequest;
use warden_engine::ptid::{Ptid, ResumeScope};
use warden_engine::sig::Sig;
use warden_engine::status::WaitStatus;
use warden_engine::StepKind;
use warden_sim::{Op, Program, SimMachine, SCRATCH_ADDR, TRAP_BYTE};

const PID: i32 = 4200;
const MAIN: Ptid = Ptid::main(PID);

#[test(tokio::test)]
async fn breakpoint_report_then_displaced_step_past_it() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 7 }) // breakpoint
        .op(Op::Nop)
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    // the trap fired before the instruction under the breakpoint ran
    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(1))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(0));

    // stepping off the breakpoint executes the store out of the scratch
    // buffer and ends the step right past it
    engine
        .proceed(
            MAIN,
            ProceedRequest {
                step: StepKind::Instruction,
                signal: Sig::NONE,
            },
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(2))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(7));
    assert_eq!(
        engine
            .inferiors()
            .next()
            .expect("inferior")
            .displaced_in_progress(),
        0
    );

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(0));
}

#[test(tokio::test)]
async fn inline_step_over_without_displaced_support() {
    let machine = SimMachine::new();
    machine.set_displaced_supported(false);

    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 7 }) // breakpoint
        .op(Op::Nop)
        .op(Op::Nop) // second breakpoint
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    breakpoints.add_breakpoint(aspace, program.addr(3));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));

    // the obstacle is lifted in place, stepped, and re-planted before the
    // thread runs on to the next breakpoint
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(3))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(7));
    assert_eq!(machine.raw_byte_at(PID, program.addr(1)), Some(TRAP_BYTE));
    assert!(engine.step_over_active().is_none());
}

#[test(tokio::test)]
async fn scratch_slot_contention_serializes_step_overs() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 1 }) // breakpoint
        .op(Op::Nop)
        .op(Op::Nop) // breakpoint
        .op(Op::ExitProcess { code: 0 })
        .op(Op::Nop) // sibling entry
        .op(Op::Store { addr: 0x5001, val: 2 }) // breakpoint
        .op(Op::Jump { target: 0x1038 }); // sibling parks itself
    machine.spawn_process(PID, &program);
    machine.add_thread(PID, 7, program.addr(5));
    let sibling = Ptid::new(PID, 7);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID), 7]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    breakpoints.add_breakpoint(aspace, program.addr(3));
    breakpoints.add_breakpoint(aspace, program.addr(6));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let first = engine.run_to_next_stop().await.expect("first stop");
    assert_eq!(first.ptid, MAIN);
    assert_eq!(first.status, WaitStatus::Stopped(Sig::TRAP));

    // the sibling trapped on its own breakpoint while the debuggee was
    // quiescing; that stop is parked and surfaces on the next command
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let second = engine.run_to_next_stop().await.expect("second stop");
    assert_eq!(second.ptid, sibling);
    assert_eq!(second.status, WaitStatus::Stopped(Sig::TRAP));

    // one scratch slot, still owned by the interrupted main thread; the
    // sibling waits its turn and both step-overs complete in order
    engine
        .proceed(sibling, ProceedRequest::default())
        .expect("proceed");
    let third = engine.run_to_next_stop().await.expect("third stop");

    assert_eq!(third.ptid, MAIN);
    assert_eq!(third.status, WaitStatus::Stopped(Sig::TRAP));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(3))
    );

    assert_eq!(machine.data_byte(PID, 0x5000), Some(1));
    assert_eq!(machine.data_byte(PID, 0x5001), Some(2));
    assert_eq!(machine.pc_of(sibling), Some(program.addr(7)));
    assert_eq!(engine.step_over_queue().count(), 0);
    assert_eq!(
        engine
            .inferiors()
            .next()
            .expect("inferior")
            .displaced_in_progress(),
        0
    );
    engine.check_invariants().expect("invariants");
}

#[test(tokio::test)]
async fn watchpoint_stop_then_step_past_it() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x6000, val: 9 }) // watched
        .op(Op::Nop)
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_watchpoint(aspace, 0x6000);

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert!(engine.thread(MAIN).expect("thread").stopped_by_watchpoint);
    assert_eq!(machine.data_byte(PID, 0x6000), Some(9));

    // non-steppable watchpoint: continuing routes through an in-line
    // step-over, after which the thread runs free to exit
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(0));
}

#[test(tokio::test)]
async fn stale_trap_accepted_within_grace() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 7 }) // breakpoint, deleted in flight
        .op(Op::Nop)
        .op(Op::Nop) // breakpoint
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    breakpoints.add_breakpoint(aspace, program.addr(3));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");

    // let the thread trap on the breakpoint, then delete it before the
    // event is consumed
    machine.kick(2);
    breakpoints.delete_breakpoint(aspace, program.addr(1));

    let report = engine.run_to_next_stop().await.expect("stop");

    // the stale trap was swallowed and the thread resumed through the
    // removed location to the surviving breakpoint
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(3))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(7));
}

#[test(tokio::test)]
async fn stale_trap_surfaces_once_grace_is_exhausted() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 7 }) // breakpoint, deleted in flight
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    engine.settings_mut().moribund_trap_grace = 0;

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    machine.kick(2);
    breakpoints.delete_breakpoint(aspace, program.addr(1));

    let report = engine.run_to_next_stop().await.expect("stop");

    // with no grace left the trap is an ordinary random SIGTRAP
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(1))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(0));
}

#[test(tokio::test)]
async fn thread_created_during_inline_step_over() {
    let machine = SimMachine::new();
    machine.set_displaced_supported(false);

    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Clone { start: 0x1020, tid: 7 }) // breakpoint
        .op(Op::Nop)
        .op(Op::Jump { target: 0x1018 }) // main parks itself
        .op(Op::Nop) // new thread entry
        .op(Op::Store { addr: 0x5400, val: 1 }) // breakpoint
        .op(Op::Jump { target: 0x1030 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    breakpoints.add_breakpoint(aspace, program.addr(5));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));

    // the stepped-over instruction spawns a thread mid-step-over; the
    // newcomer is held until the step-over clears, then runs into its own
    // breakpoint
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, Ptid::new(PID, 7));
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert_eq!(
        engine.thread(Ptid::new(PID, 7)).expect("thread").stop_pc,
        Some(program.addr(5))
    );
    assert_eq!(engine.threads().count(), 2);
    assert!(engine.step_over_active().is_none());
    assert_eq!(machine.raw_byte_at(PID, program.addr(1)), Some(TRAP_BYTE));
    engine.check_invariants().expect("invariants");
}

#[test(tokio::test)]
async fn interrupt_during_inline_step_over_reinserts_the_breakpoint() {
    let machine = SimMachine::new();
    machine.set_displaced_supported(false);

    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 7 }) // breakpoint
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));

    // interrupt while the obstacle is lifted and the thread is mid-step;
    // the stop must hand the world back intact, breakpoint included
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    engine.request_stop(ResumeScope::All).expect("interrupt");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert!(engine.step_over_active().is_none());
    assert_eq!(machine.raw_byte_at(PID, program.addr(1)), Some(TRAP_BYTE));
    assert_eq!(machine.data_byte(PID, 0x5000), Some(0));
    engine.check_invariants().expect("invariants");

    // continuing re-detects the obstacle and completes the step-over
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(0));
    assert_eq!(machine.data_byte(PID, 0x5000), Some(7));
}

#[test(tokio::test)]
async fn interrupt_during_displaced_step_surfaces_quietly() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 7 }) // breakpoint
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));

    // interrupt with the thread's PC still inside the scratch buffer: the
    // copied instruction never ran, so the stop lands back on the obstacle
    // and no signal leaks into the debuggee
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    engine.request_stop(ResumeScope::All).expect("interrupt");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(1))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(0));
    assert_eq!(
        engine
            .inferiors()
            .next()
            .expect("inferior")
            .displaced_in_progress(),
        0
    );
    assert!(machine.delivered_signals().is_empty());

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(0));
    assert_eq!(machine.data_byte(PID, 0x5000), Some(7));
    assert!(machine.delivered_signals().is_empty());
}

#[test(tokio::test)]
async fn step_over_lands_on_a_tripped_watchpoint() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x6000, val: 9 }) // breakpoint, watched store
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    breakpoints.add_watchpoint(aspace, 0x6000);

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert!(!engine.thread(MAIN).expect("thread").stopped_by_watchpoint);

    // the stepped-over store writes the watched byte; completing the
    // step-over must surface that, not silently continue
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert!(engine.thread(MAIN).expect("thread").stopped_by_watchpoint);
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(2))
    );
    assert_eq!(machine.data_byte(PID, 0x6000), Some(9));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(0));
}

#[test(tokio::test)]
async fn non_stop_inline_step_over_restarts_paused_peers() {
    let machine = SimMachine::new();
    machine.set_displaced_supported(false);

    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 1 }) // breakpoint
        .op(Op::ExitProcess { code: 0 })
        .op(Op::Jump { target: 0x1018 }); // sibling parks itself
    machine.spawn_process(PID, &program);
    machine.add_thread(PID, 7, program.addr(3));
    let sibling = Ptid::new(PID, 7);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID), 7]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));
    engine.settings_mut().non_stop = true;

    engine
        .proceed(sibling, ProceedRequest::default())
        .expect("proceed");
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    // only the reporting thread stops; the sibling keeps spinning
    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    assert!(engine.thread(sibling).expect("sibling").executing);

    // the in-line step-over quiesces the sibling for its duration, then
    // puts it back the way it was; its pause is not a reportable stop
    engine
        .proceed(
            MAIN,
            ProceedRequest {
                step: StepKind::Instruction,
                signal: Sig::NONE,
            },
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(2))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(1));
    assert!(engine.step_over_active().is_none());
    assert_eq!(machine.raw_byte_at(PID, program.addr(1)), Some(TRAP_BYTE));
    assert!(engine.thread(sibling).expect("sibling").executing);
    engine.check_invariants().expect("invariants");

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(0));
}

#[test(tokio::test)]
async fn detach_completes_an_in_flight_displaced_step() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Store { addr: 0x5000, val: 1 }) // breakpoint
        .op(Op::Nop)
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");
    breakpoints.add_breakpoint(aspace, program.addr(1));

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));
    machine.clear_write_log();

    // start the step-over, then detach while the thread's PC is still
    // inside the scratch buffer
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let id = engine.inferiors().next().expect("inferior").id();
    engine.detach(id).await.expect("detach");

    assert_eq!(engine.inferiors().count(), 0);
    assert_eq!(engine.threads().count(), 0);

    // the detached process ran free to completion, never executing out of
    // the scratch buffer: one write staged the relocated copy, one
    // restored the original bytes
    assert!(!machine.process_exists(PID));
    let scratch_writes: Vec<_> = machine
        .write_log()
        .into_iter()
        .filter(|&(addr, _)| addr == SCRATCH_ADDR)
        .collect();
    assert_eq!(scratch_writes.len(), 2);
    engine.check_invariants().expect("invariants");
}
