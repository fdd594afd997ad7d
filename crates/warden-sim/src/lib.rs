//! Deterministic in-process debuggee for exercising the run-control engine.
//!
//! [SimMachine] hosts one or more simulated processes executing small
//! encoded programs, with forks, vforks, execs, threads, signals and a
//! displaced-stepping scratch buffer. [SimTarget] and [SimBreakpoints] are
//! its two faces as the engine's collaborators; both are cheap clones over
//! the shared machine, so tests can keep handles for setup and inspection
//! while an engine instance owns its own.
//!
//! Execution only advances inside blocking waits, one instruction per
//! runnable thread per round, so every test run is reproducible.

mod breakpoints;
mod error;
mod machine;
mod target;

pub use self::breakpoints::SimBreakpoints;
pub use self::error::SimError;
pub use self::machine::{Op, Program, SimMachine, INSN_LEN, SCRATCH_ADDR, TRAP_BYTE};
pub use self::target::SimTarget;
