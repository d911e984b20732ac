//! per-channel DRAM state: bank FSMs, command timing, refresh

use std::collections::VecDeque;
use std::sync::Arc;

use super::address::Address;
use super::command::{Command, CommandType};
use super::config::Config;

/// one bank's row buffer plus its earliest-issue clocks
#[derive(Debug, Clone, Default)]
struct BankState {
    open_row: Option<u64>,
    row_hit_count: u64,
    earliest_activate: u64,
    earliest_read: u64,
    earliest_write: u64,
    earliest_precharge: u64,
}

impl BankState {
    fn is_row_open(&self, row: u64) -> bool {
        self.open_row == Some(row)
    }
}

/// bank/rank state machines and timing enforcement for one channel.
/// `get_ready_command` derives the command actually required to make
/// progress (ACTIVATE / PRECHARGE before a column command, PRECHARGE
/// before a refresh) and checks it against the earliest-issue clocks
/// maintained by `update_timing_and_states`.
pub struct ChannelState {
    config: Arc<Config>,
    banks: Vec<Vec<Vec<BankState>>>,
    rank_in_sref: Vec<bool>,
    rank_earliest_sref_exit: Vec<u64>,
    /// consecutive cycles each rank spent with all banks idle,
    /// maintained by the controller's power accounting
    pub rank_idle_cycles: Vec<u64>,
    refresh_counter: u64,
    refresh_interval: u64,
    next_refresh_rank: usize,
    refresh_pending: VecDeque<usize>,
}

impl ChannelState {
    pub fn new(config: Arc<Config>) -> Self {
        let banks = (0..config.ranks)
            .map(|_| {
                (0..config.bankgroups)
                    .map(|_| vec![BankState::default(); config.banks_per_group])
                    .collect()
            })
            .collect();
        // stagger rank refreshes so each rank sees one per tREFI
        let refresh_interval = (config.trefi / config.ranks as u64).max(1);
        Self {
            banks,
            rank_in_sref: vec![false; config.ranks],
            rank_earliest_sref_exit: vec![0; config.ranks],
            rank_idle_cycles: vec![0; config.ranks],
            refresh_counter: 0,
            refresh_interval,
            next_refresh_rank: 0,
            refresh_pending: VecDeque::new(),
            config,
        }
    }

    fn bank(&self, addr: &Address) -> &BankState {
        &self.banks[addr.rank][addr.bankgroup][addr.bank]
    }

    fn bank_mut(&mut self, addr: &Address) -> &mut BankState {
        &mut self.banks[addr.rank][addr.bankgroup][addr.bank]
    }

    /// advance the refresh counter, raising a pending rank-level
    /// refresh every interval
    pub fn tick_refresh(&mut self) {
        self.refresh_counter += 1;
        if self.refresh_counter >= self.refresh_interval {
            self.refresh_counter = 0;
            let rank = self.next_refresh_rank;
            self.next_refresh_rank = (self.next_refresh_rank + 1) % self.config.ranks;
            // a self-refreshing rank maintains itself
            if !self.rank_in_sref[rank] {
                self.refresh_pending.push_back(rank);
            }
        }
    }

    pub fn is_refresh_waiting(&self) -> bool {
        !self.refresh_pending.is_empty()
    }

    pub fn refresh_rank(&self) -> Option<usize> {
        self.refresh_pending.front().copied()
    }

    pub fn is_rank_self_refreshing(&self, rank: usize) -> bool {
        self.rank_in_sref[rank]
    }

    pub fn is_all_bank_idle_in_rank(&self, rank: usize) -> bool {
        self.banks[rank]
            .iter()
            .flatten()
            .all(|bank| bank.open_row.is_none())
    }

    pub fn row_hit_count(&self, rank: usize, bankgroup: usize, bank: usize) -> u64 {
        self.banks[rank][bankgroup][bank].row_hit_count
    }

    /// the command needed to make progress towards `cmd`, if its
    /// timing constraints are met this cycle
    pub fn get_ready_command(&self, cmd: &Command, clk: u64) -> Option<Command> {
        match cmd.cmd_type {
            CommandType::Read
            | CommandType::ReadPrecharge
            | CommandType::Write
            | CommandType::WritePrecharge => {
                if self.rank_in_sref[cmd.rank()] {
                    return None;
                }
                let bank = self.bank(&cmd.addr);
                if bank.is_row_open(cmd.row()) {
                    let earliest = if cmd.is_write() {
                        bank.earliest_write
                    } else {
                        bank.earliest_read
                    };
                    (clk >= earliest).then_some(*cmd)
                } else if bank.open_row.is_some() {
                    (clk >= bank.earliest_precharge)
                        .then(|| Command::new(CommandType::Precharge, cmd.addr, cmd.hex_addr))
                } else {
                    (clk >= bank.earliest_activate)
                        .then(|| Command::new(CommandType::Activate, cmd.addr, cmd.hex_addr))
                }
            }
            CommandType::Refresh => {
                let rank = cmd.rank();
                if self.rank_in_sref[rank] {
                    return None;
                }
                // precharge any open bank before the rank refresh
                for (bg, group) in self.banks[rank].iter().enumerate() {
                    for (bank_idx, bank) in group.iter().enumerate() {
                        if bank.open_row.is_some() {
                            let addr = Address {
                                rank,
                                bankgroup: bg,
                                bank: bank_idx,
                                ..Default::default()
                            };
                            return (clk >= bank.earliest_precharge)
                                .then(|| Command::new(CommandType::Precharge, addr, cmd.hex_addr));
                        }
                    }
                }
                let ready = self.banks[rank]
                    .iter()
                    .flatten()
                    .all(|bank| clk >= bank.earliest_activate);
                ready.then_some(*cmd)
            }
            CommandType::RefreshBank => {
                let bank = self.bank(&cmd.addr);
                if bank.open_row.is_some() {
                    (clk >= bank.earliest_precharge)
                        .then(|| Command::new(CommandType::Precharge, cmd.addr, cmd.hex_addr))
                } else {
                    (clk >= bank.earliest_activate).then_some(*cmd)
                }
            }
            CommandType::SrefEnter => {
                let rank = cmd.rank();
                if self.rank_in_sref[rank] || !self.is_all_bank_idle_in_rank(rank) {
                    return None;
                }
                let ready = self.banks[rank]
                    .iter()
                    .flatten()
                    .all(|bank| clk >= bank.earliest_activate);
                ready.then_some(*cmd)
            }
            CommandType::SrefExit => {
                let rank = cmd.rank();
                (self.rank_in_sref[rank] && clk >= self.rank_earliest_sref_exit[rank])
                    .then_some(*cmd)
            }
            CommandType::Activate | CommandType::Precharge => {
                // only derived internally, never requested directly
                None
            }
        }
    }

    pub fn update_timing_and_states(&mut self, cmd: &Command, clk: u64) {
        let config = Arc::clone(&self.config);
        match cmd.cmd_type {
            CommandType::Activate => {
                let bank = self.bank_mut(&cmd.addr);
                bank.open_row = Some(cmd.row());
                bank.row_hit_count = 0;
                bank.earliest_read = clk + config.trcd;
                bank.earliest_write = clk + config.trcd;
                bank.earliest_precharge = clk + config.tras;
                bank.earliest_activate = clk + config.tras + config.trp;
            }
            CommandType::Read => {
                let bank = self.bank_mut(&cmd.addr);
                bank.row_hit_count += 1;
                bank.earliest_read = clk + config.tccd;
                bank.earliest_write = clk + config.tccd;
                bank.earliest_precharge = bank.earliest_precharge.max(clk + config.tccd);
            }
            CommandType::Write => {
                let bank = self.bank_mut(&cmd.addr);
                bank.row_hit_count += 1;
                bank.earliest_read = clk + config.tccd;
                bank.earliest_write = clk + config.tccd;
                // write recovery holds the precharge longer
                bank.earliest_precharge = bank.earliest_precharge.max(clk + config.write_delay);
            }
            CommandType::ReadPrecharge => {
                let bank = self.bank_mut(&cmd.addr);
                bank.open_row = None;
                bank.row_hit_count = 0;
                bank.earliest_activate = clk + config.tccd + config.trp;
            }
            CommandType::WritePrecharge => {
                let bank = self.bank_mut(&cmd.addr);
                bank.open_row = None;
                bank.row_hit_count = 0;
                bank.earliest_activate = clk + config.write_delay + config.trp;
            }
            CommandType::Precharge => {
                let bank = self.bank_mut(&cmd.addr);
                bank.open_row = None;
                bank.row_hit_count = 0;
                bank.earliest_activate = bank.earliest_activate.max(clk + config.trp);
            }
            CommandType::Refresh => {
                if self.refresh_rank() == Some(cmd.rank()) {
                    self.refresh_pending.pop_front();
                }
                for bank in self.banks[cmd.rank()].iter_mut().flatten() {
                    bank.earliest_activate = clk + config.trfc;
                }
            }
            CommandType::RefreshBank => {
                let bank = self.bank_mut(&cmd.addr);
                bank.earliest_activate = clk + config.trfc;
            }
            CommandType::SrefEnter => {
                self.rank_in_sref[cmd.rank()] = true;
                self.rank_earliest_sref_exit[cmd.rank()] = clk + config.tckesr;
            }
            CommandType::SrefExit => {
                self.rank_in_sref[cmd.rank()] = false;
                for bank in self.banks[cmd.rank()].iter_mut().flatten() {
                    bank.earliest_activate = clk + config.txs;
                }
            }
        }
    }
}
