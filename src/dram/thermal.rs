//! thermal model hook

use super::command::Command;

/// receives per-command power events and per-epoch background energy.
/// the controller takes an optional boxed model at construction, so
/// builds without a thermal model pay nothing.
pub trait ThermalModel: Send {
    fn update_cmd_power(&mut self, channel: usize, cmd: &Command, clk: u64);
    fn update_background_energy(&mut self, channel: usize, rank: usize, background_energy: f64);
}

/// discards every update
#[derive(Debug, Default)]
pub struct NoopThermal;

impl ThermalModel for NoopThermal {
    fn update_cmd_power(&mut self, _channel: usize, _cmd: &Command, _clk: u64) {}
    fn update_background_energy(&mut self, _channel: usize, _rank: usize, _bg_energy: f64) {}
}
