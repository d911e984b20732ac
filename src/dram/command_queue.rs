//! per-bank command queues and the issue policy

use std::collections::VecDeque;
use std::sync::Arc;

use super::channel_state::ChannelState;
use super::command::{Command, CommandType};
use super::config::Config;

/// holds scheduled commands, one bounded queue per bank. issue is
/// round-robin across banks, asking `ChannelState` for the command
/// actually required (the head column command itself, or the
/// ACTIVATE / PRECHARGE preparing for it).
pub struct CommandQueue {
    config: Arc<Config>,
    queues: Vec<VecDeque<Command>>,
    next_queue: usize,
    /// per-rank emptiness, refreshed every tick; read by the
    /// controller's self-refresh policy
    pub rank_q_empty: Vec<bool>,
}

impl CommandQueue {
    pub fn new(config: Arc<Config>) -> Self {
        let num_queues = config.ranks * config.banks_per_channel();
        Self {
            queues: (0..num_queues).map(|_| VecDeque::new()).collect(),
            next_queue: 0,
            rank_q_empty: vec![true; config.ranks],
            config,
        }
    }

    fn queue_index(&self, rank: usize, bankgroup: usize, bank: usize) -> usize {
        rank * self.config.banks_per_channel()
            + bankgroup * self.config.banks_per_group
            + bank
    }

    pub fn will_accept_command(&self, rank: usize, bankgroup: usize, bank: usize) -> bool {
        self.queues[self.queue_index(rank, bankgroup, bank)].len() < self.config.cmd_queue_size
    }

    pub fn add_command(&mut self, cmd: Command) {
        let idx = self.queue_index(cmd.rank(), cmd.bankgroup(), cmd.bank());
        debug_assert!(self.queues[idx].len() < self.config.cmd_queue_size);
        self.queues[idx].push_back(cmd);
        self.rank_q_empty[cmd.rank()] = false;
    }

    /// the next ready command in round-robin bank order. the head
    /// entry is dequeued only when it is itself the ready command;
    /// a derived ACTIVATE / PRECHARGE leaves it queued.
    pub fn get_command_to_issue(
        &mut self,
        channel_state: &ChannelState,
        clk: u64,
    ) -> Option<Command> {
        for i in 0..self.queues.len() {
            let idx = (self.next_queue + i) % self.queues.len();
            let Some(&head) = self.queues[idx].front() else {
                continue;
            };
            if let Some(ready) = channel_state.get_ready_command(&head, clk) {
                if ready.cmd_type == head.cmd_type {
                    self.queues[idx].pop_front();
                }
                self.next_queue = (idx + 1) % self.queues.len();
                return Some(ready);
            }
        }
        None
    }

    /// produce the command moving the pending rank refresh forward:
    /// the REFRESH itself, or a PRECHARGE closing an open bank first
    pub fn finish_refresh(&mut self, channel_state: &ChannelState, clk: u64) -> Option<Command> {
        let rank = channel_state.refresh_rank()?;
        let refresh = Command::new(
            CommandType::Refresh,
            super::address::Address::rank_only(rank),
            0,
        );
        channel_state.get_ready_command(&refresh, clk)
    }

    /// put back a column command dequeued by `get_command_to_issue`
    /// but not issued (HBM dual-issue polarity mismatch)
    pub fn unget(&mut self, cmd: Command) {
        let idx = self.queue_index(cmd.rank(), cmd.bankgroup(), cmd.bank());
        self.queues[idx].push_front(cmd);
        self.rank_q_empty[cmd.rank()] = false;
    }

    pub fn queue_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn queue_usage(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn clock_tick(&mut self) {
        for rank in 0..self.config.ranks {
            let start = rank * self.config.banks_per_channel();
            let end = start + self.config.banks_per_channel();
            self.rank_q_empty[rank] = self.queues[start..end].iter().all(VecDeque::is_empty);
        }
    }
}
