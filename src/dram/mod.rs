//! the DRAM simulation core: one controller per channel, advanced in
//! lock step by a trace-driven front end

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::Result;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use self::config::Config;
use self::controller::Controller;
use self::trace::TraceRequest;
use self::transaction::Transaction;

pub mod address;
pub mod channel_state;
pub mod command;
pub mod command_queue;
pub mod config;
pub mod controller;
pub mod stats;
pub mod thermal;
pub mod trace;
pub mod transaction;

#[derive(Debug, Serialize)]
pub struct SimSummary {
    pub cycles: u64,
    pub reads_done: u64,
    pub writes_done: u64,
}

/// owns one controller per channel and replays a trace against them.
/// channels share no state, so ticking them in parallel is sound.
pub struct Simulator {
    config: Arc<Config>,
    controllers: Vec<Controller>,
    clk: u64,
}

impl Simulator {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.validate()?;
        let controllers = (0..config.channels)
            .map(|channel| Controller::new(channel, Arc::clone(&config), None))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            controllers,
            clk: 0,
        })
    }

    /// replay the trace until every accepted transaction has been
    /// handed back, or ctrl-c
    pub fn run(&mut self, trace: &[TraceRequest]) -> Result<SimSummary> {
        let mut next = 0;
        let mut outstanding = 0u64;
        let mut reads_done = 0;
        let mut writes_done = 0;

        while next < trace.len() || outstanding > 0 {
            if crate::STOP.load(Ordering::Relaxed) {
                info!("stop requested, ending simulation early");
                break;
            }

            // offer due requests in order; a full queue stalls the head
            while next < trace.len() && trace[next].cycle <= self.clk {
                let request = &trace[next];
                let channel = self.config.address_mapping(request.addr).channel;
                let ctrl = &mut self.controllers[channel];
                let mut trans = if request.is_write {
                    Transaction::write(request.addr, request.cycle)
                } else {
                    Transaction::read(request.addr, request.cycle)
                };
                let accepted = if self.config.dist_controller {
                    let requester = request.requester % self.config.requesters_per_channel;
                    trans = trans.from_requester(requester);
                    ctrl.will_accept_transaction_from(request.addr, requester, request.is_write)
                } else {
                    ctrl.will_accept_transaction(request.addr, request.is_write)
                };
                if !accepted {
                    break;
                }
                ctrl.add_transaction(trans);
                outstanding += 1;
                next += 1;
            }

            self.controllers
                .par_iter_mut()
                .try_for_each(|ctrl| ctrl.clock_tick())?;
            self.clk += 1;

            for ctrl in &mut self.controllers {
                while let Some((addr, is_write)) = ctrl.return_done_trans(self.clk) {
                    debug!(clk = self.clk, addr, is_write, "transaction done");
                    outstanding -= 1;
                    if is_write {
                        writes_done += 1;
                    } else {
                        reads_done += 1;
                    }
                }
            }

            if self.config.epoch_period > 0 && self.clk % self.config.epoch_period == 0 {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for ctrl in &mut self.controllers {
                    writeln!(out, "###### epoch stats, channel {} ######", ctrl.channel_id())?;
                    ctrl.print_epoch_stats(&mut out)?;
                }
                info!(
                    clk = self.clk,
                    reads_done, writes_done, outstanding, "epoch boundary"
                );
            }
        }

        Ok(SimSummary {
            cycles: self.clk,
            reads_done,
            writes_done,
        })
    }

    pub fn print_final_stats(&mut self, w: &mut dyn Write) -> Result<()> {
        for ctrl in &mut self.controllers {
            writeln!(w, "###### channel {} ######", ctrl.channel_id())?;
            ctrl.print_final_stats(w)?;
        }
        Ok(())
    }
}
