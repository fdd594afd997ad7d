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
use warden_engine::settings::SchedulerLocking;
use warden_engine::sig::Sig;
use warden_engine::status::WaitStatus;
use warden_engine::StepKind;
use warden_sim::{Op, Program, SimMachine};

const PID: i32 = 4100;
const MAIN: Ptid = Ptid::main(PID);

fn stepping(step: StepKind) -> ProceedRequest {
    ProceedRequest {
        step,
        signal: Sig::NONE,
    }
}

#[test(tokio::test)]
async fn single_instruction_step() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Store { addr: 0x5000, val: 1 })
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, _breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);

    engine
        .proceed(MAIN, stepping(StepKind::Instruction))
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(1))
    );
    assert_eq!(machine.data_byte(PID, 0x5000), Some(1));
}

#[test(tokio::test)]
async fn step_ends_when_leaving_the_line_range() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Nop)
        .op(Op::Nop)
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, _breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);

    // the first three instructions form one line; the step is silent until
    // the PC leaves it
    engine
        .proceed(
            MAIN,
            stepping(StepKind::Range {
                start: program.addr(0),
                end: program.addr(3),
            }),
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(3))
    );
}

#[test(tokio::test)]
async fn step_runs_through_a_trampoline() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Jump { target: 0x1020 })
        .op(Op::Nop)
        .op(Op::Nop)
        .op(Op::Nop) // 0x1020, trampoline body
        .op(Op::Jump { target: 0x1038 })
        .op(Op::Nop)
        .op(Op::Nop) // 0x1038, landing
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");

    breakpoints.add_trampoline(
        aspace,
        program.addr(4),
        program.addr(6),
        Some(program.addr(7)),
    );

    engine
        .proceed(
            MAIN,
            stepping(StepKind::Range {
                start: program.addr(0),
                end: program.addr(2),
            }),
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    // the trampoline was crossed at full speed and the step finished one
    // instruction past its known destination
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(8))
    );

    // the destination's step-resume breakpoint is gone again
    assert_ne!(
        machine.raw_byte_at(PID, program.addr(7)),
        Some(warden_sim::TRAP_BYTE)
    );
}

#[test(tokio::test)]
async fn step_into_code_without_line_info_ends_there() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Jump { target: 0x1020 })
        .op(Op::Nop)
        .op(Op::Nop)
        .op(Op::Nop) // 0x1020, no line info from here on
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");

    breakpoints.add_no_line(aspace, program.addr(4), 0x2000);

    engine
        .proceed(
            MAIN,
            stepping(StepKind::Range {
                start: program.addr(0),
                end: program.addr(2),
            }),
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    // nothing to unwind to in the simulated machine, so the step ends at
    // the undebuggable landing rather than stepping blind through it
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(4))
    );
}

#[test(tokio::test)]
async fn step_skips_an_inlined_callee() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Nop) // inlined body
        .op(Op::Nop) // inlined body
        .op(Op::Nop)
        .op(Op::ExitProcess { code: 0 });
    machine.spawn_process(PID, &program);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);
    let aspace = machine.aspace_of(PID).expect("aspace");

    breakpoints.add_inlined_callee(aspace, program.addr(1), program.addr(3));

    engine
        .proceed(
            MAIN,
            stepping(StepKind::Range {
                start: program.addr(0),
                end: program.addr(1),
            }),
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));
    assert_eq!(
        engine.thread(MAIN).expect("thread").stop_pc,
        Some(program.addr(3))
    );
}

#[test(tokio::test)]
async fn noisy_signal_passes_through_silently() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Raise { signo: Sig::ALRM.0 })
        .op(Op::Nop)
        .op(Op::Raise { signo: Sig::ILL.0 })
        .op(Op::ExitProcess { code: 3 });
    machine.spawn_process(PID, &program);

    let (mut engine, _breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);

    // the alarm is re-delivered without surfacing; the fault stops
    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::ILL));

    // the user chose to forward the fault to the debuggee
    engine
        .proceed(
            MAIN,
            ProceedRequest {
                step: StepKind::None,
                signal: Sig::ILL,
            },
        )
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Exited(3));

    assert_eq!(
        machine.delivered_signals(),
        vec![(MAIN, Sig::ALRM), (MAIN, Sig::ILL)]
    );
}

#[test(tokio::test)]
async fn interrupt_surfaces_as_a_quiet_stop() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000).op(Op::Jump { target: 0x1000 });
    machine.spawn_process(PID, &program);

    let (mut engine, _breakpoints) = common::attach(&machine, PID, &[i64::from(PID)]);

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    engine.request_stop(ResumeScope::All).expect("interrupt");

    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));

    // interrupting an already-stopped thread must not get lost either
    engine
        .request_stop(ResumeScope::Thread(MAIN))
        .expect("interrupt");
    let report = engine.run_to_next_stop().await.expect("stop");
    assert_eq!(report.status, WaitStatus::Stopped(Sig::NONE));

    engine.check_invariants().expect("invariants");
}

#[test(tokio::test)]
async fn scheduler_locking_holds_other_threads() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Nop)
        .op(Op::Nop)
        .op(Op::Nop) // breakpoint
        .op(Op::Jump { target: 0x1018 }); // sibling parks itself
    machine.spawn_process(PID, &program);
    machine.add_thread(PID, 7, program.addr(3));
    let sibling = Ptid::new(PID, 7);

    let (mut engine, breakpoints) = common::attach(&machine, PID, &[i64::from(PID), 7]);
    let aspace = machine.aspace_of(PID).expect("aspace");

    breakpoints.add_breakpoint(aspace, program.addr(2));
    engine.settings_mut().scheduler_locking = SchedulerLocking::On;

    engine
        .proceed(MAIN, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.ptid, MAIN);
    assert_eq!(report.status, WaitStatus::Stopped(Sig::TRAP));

    // the sibling never moved
    assert_eq!(machine.pc_of(sibling), Some(program.addr(3)));
    assert!(engine.thread(sibling).expect("sibling").is_stopped());
}

#[test(tokio::test)]
async fn silent_thread_exit_reports_no_resumed() {
    let machine = SimMachine::new();
    let program = Program::new(0x1000)
        .op(Op::Jump { target: 0x1000 }) // main parks itself
        .op(Op::ExitThread { code: 0 }); // sibling entry
    machine.spawn_process(PID, &program);
    machine.add_thread(PID, 7, program.addr(1));
    let sibling = Ptid::new(PID, 7);

    let (mut engine, _breakpoints) = common::attach(&machine, PID, &[i64::from(PID), 7]);
    engine.settings_mut().scheduler_locking = SchedulerLocking::On;

    // the only resumed thread exits without any report; the engine must
    // re-validate against the target and surface the end of the command
    engine
        .proceed(sibling, ProceedRequest::default())
        .expect("proceed");
    let report = engine.run_to_next_stop().await.expect("stop");

    assert_eq!(report.status, WaitStatus::NoResumed);
    assert!(engine.thread(sibling).is_none());
    assert!(engine.thread(MAIN).is_some());
    assert!(!machine.thread_exists(sibling));
}
