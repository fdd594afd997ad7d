use warden_engine::control::RunControl;
use warden_engine::settings::Settings;
use warden_sim::{SimBreakpoints, SimMachine, SimTarget};

pub type Engine = RunControl<SimTarget, SimBreakpoints>;

/// Builds an engine over the machine and registers one already-spawned
/// process with it.
pub fn attach(machine: &SimMachine, pid: i32, tids: &[i64]) -> (Engine, SimBreakpoints) {
    let breakpoints = machine.breakpoints();
    let mut engine = RunControl::new(machine.target(), breakpoints.clone(), Settings::default());

    engine
        .create_inferior(pid, tids)
        .expect("inferior registered");

    (engine, breakpoints)
}
