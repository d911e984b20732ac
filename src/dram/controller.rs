//! the per-channel scheduling core: transaction ingress, write-drain
//! state machine, command emission and completion tracking

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use enum_as_inner::EnumAsInner;
use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use tracing::debug;

use super::address::Address;
use super::channel_state::ChannelState;
use super::command::{Command, CommandType};
use super::command_queue::CommandQueue;
use super::config::{Config, RowBufPolicy};
use super::stats::Statistics;
use super::thermal::ThermalModel;
use super::transaction::Transaction;

/// shared write stage capacity in distributed split mode
const DIST_WRITE_BUFFER_SIZE: usize = 32;
/// start draining early once the write buffer holds more than this
/// many entries and the command queue has gone idle
const WRITE_DRAIN_LOW_WATERMARK: usize = 8;

/// the four queue layouts spanned by (centralized | distributed) x
/// (unified | split). each has its own ingress and scheduling path.
#[derive(Debug, EnumAsInner)]
pub enum TransQueues {
    CentralUnified {
        unified: VecDeque<Transaction>,
    },
    CentralSplit {
        reads: VecDeque<Transaction>,
        writes: VecDeque<Transaction>,
    },
    DistUnified {
        requesters: Vec<VecDeque<Transaction>>,
        /// single-entry stage between the requester queues and the
        /// scheduler
        shared: VecDeque<Transaction>,
        last_requester: usize,
    },
    DistSplit {
        read_requesters: Vec<VecDeque<Transaction>>,
        write_requesters: Vec<VecDeque<Transaction>>,
        /// one single-entry read stage per bank
        per_bank_reads: Vec<VecDeque<Transaction>>,
        shared_writes: VecDeque<Transaction>,
        last_read_requester: usize,
        last_write_requester: usize,
    },
}

impl TransQueues {
    fn new(config: &Config) -> Self {
        let requesters = config.requesters_per_channel;
        // rotors seeded so the first promotion services requester 0
        match (config.dist_controller, config.unified_queue) {
            (false, true) => TransQueues::CentralUnified {
                unified: VecDeque::new(),
            },
            (false, false) => TransQueues::CentralSplit {
                reads: VecDeque::new(),
                writes: VecDeque::new(),
            },
            (true, true) => TransQueues::DistUnified {
                requesters: (0..requesters).map(|_| VecDeque::new()).collect(),
                shared: VecDeque::new(),
                last_requester: requesters - 1,
            },
            (true, false) => TransQueues::DistSplit {
                read_requesters: (0..requesters).map(|_| VecDeque::new()).collect(),
                write_requesters: (0..requesters).map(|_| VecDeque::new()).collect(),
                per_bank_reads: (0..config.banks_per_channel())
                    .map(|_| VecDeque::new())
                    .collect(),
                shared_writes: VecDeque::new(),
                last_read_requester: requesters - 1,
                last_write_requester: requesters - 1,
            },
        }
    }
}

fn trans_to_command(config: &Config, policy: RowBufPolicy, trans: &Transaction) -> Command {
    let addr = config.address_mapping(trans.addr);
    let cmd_type = match (trans.is_write, policy) {
        (false, RowBufPolicy::OpenPage) => CommandType::Read,
        (true, RowBufPolicy::OpenPage) => CommandType::Write,
        (false, RowBufPolicy::ClosePage) => CommandType::ReadPrecharge,
        (true, RowBufPolicy::ClosePage) => CommandType::WritePrecharge,
    };
    Command::new(cmd_type, addr, trans.addr)
}

/// the disjoint controller state a scheduling walk needs besides the
/// source queue itself
struct EmitCtx<'a> {
    clk: u64,
    config: &'a Config,
    row_buf_policy: RowBufPolicy,
    cmd_queue: &'a mut CommandQueue,
    pending_rd: &'a mut HashMap<u64, Vec<Transaction>>,
    pending_wr: &'a mut HashMap<u64, Transaction>,
    stats: &'a mut Statistics,
    write_draining: &'a mut usize,
}

/// walk `queue` and hand at most one transaction's command to the
/// command queue. `link_latency` gates transactions still in flight
/// on the requester link; `split_writes` enables the write-drain
/// bookkeeping and the R->W dependency abort.
fn emit_one(
    ctx: &mut EmitCtx,
    queue: &mut VecDeque<Transaction>,
    link_latency: Option<u64>,
    split_writes: bool,
) -> bool {
    for i in 0..queue.len() {
        let trans = queue[i].clone();
        if let Some(link) = link_latency {
            if trans.dist_link_start + link > ctx.clk {
                continue;
            }
        }
        let cmd = trans_to_command(ctx.config, ctx.row_buf_policy, &trans);
        if !ctx
            .cmd_queue
            .will_accept_command(cmd.rank(), cmd.bankgroup(), cmd.bank())
        {
            continue;
        }
        if trans.is_write {
            if let Some(req) = ctx.pending_wr.get_mut(&trans.addr) {
                req.schedule_cycle = ctx.clk;
                let latency = ctx.clk - req.added_cycle;
                ctx.stats.add_value("command_queuing_latency", latency);
                ctx.stats.add_value("write_command_queuing_latency", latency);
            }
            if split_writes {
                // a pending read to the same address must issue first
                if ctx.pending_rd.contains_key(&trans.addr) {
                    ctx.stats.inc("num_wr_dependency");
                    *ctx.write_draining = 0;
                    return false;
                }
                *ctx.write_draining = ctx.write_draining.saturating_sub(1);
            }
        } else if let Some(reqs) = ctx.pending_rd.get_mut(&trans.addr) {
            for req in reqs.iter_mut() {
                req.schedule_cycle = ctx.clk;
                let latency = ctx.clk - req.added_cycle;
                ctx.stats.add_value("command_queuing_latency", latency);
                ctx.stats.add_value("read_command_queuing_latency", latency);
            }
        }
        debug!(clk = ctx.clk, %cmd, "transaction scheduled");
        ctx.cmd_queue.add_command(cmd);
        queue.remove(i);
        return true;
    }
    false
}

/// one DRAM channel's controller, advanced in lock step with the
/// global simulator clock via `clock_tick`
pub struct Controller {
    channel_id: usize,
    clk: u64,
    config: Arc<Config>,
    stats: Statistics,
    channel_state: ChannelState,
    cmd_queue: CommandQueue,
    thermal: Option<Box<dyn ThermalModel>>,
    cmd_trace: Option<BufWriter<File>>,
    stats_csv: Option<BufWriter<File>>,
    queues: TransQueues,
    /// coalesced pending reads per host address; nonempty while the
    /// key exists
    pending_rd: HashMap<u64, Vec<Transaction>>,
    /// at most one outstanding write per host address
    pending_wr: HashMap<u64, Transaction>,
    return_queue: Vec<Transaction>,
    row_buf_policy: RowBufPolicy,
    /// remaining writes to drain; zero means the scheduler serves
    /// reads
    write_draining: usize,
    last_trans_clk: u64,
}

impl Controller {
    pub fn new(
        channel_id: usize,
        config: Arc<Config>,
        thermal: Option<Box<dyn ThermalModel>>,
    ) -> Result<Self> {
        let cmd_trace = if config.enable_cmd_trace {
            let path = format!("{}ch_{}cmd.trace", config.output_prefix, channel_id);
            Some(BufWriter::new(File::create(path)?))
        } else {
            None
        };
        let stats = Statistics::new(Arc::clone(&config), channel_id);
        let stats_csv = if config.output_prefix.is_empty() {
            None
        } else {
            let path = format!("{}ch_{}stats.csv", config.output_prefix, channel_id);
            let mut csv = BufWriter::new(File::create(path)?);
            stats.csv_header(&mut csv)?;
            Some(csv)
        };
        Ok(Self {
            channel_id,
            clk: 0,
            stats,
            channel_state: ChannelState::new(Arc::clone(&config)),
            cmd_queue: CommandQueue::new(Arc::clone(&config)),
            thermal,
            cmd_trace,
            stats_csv,
            queues: TransQueues::new(&config),
            pending_rd: HashMap::new(),
            pending_wr: HashMap::new(),
            return_queue: Vec::new(),
            row_buf_policy: config.row_buf_policy,
            write_draining: 0,
            last_trans_clk: 0,
            config,
        })
    }

    pub fn channel_id(&self) -> usize {
        self.channel_id
    }

    pub fn clk(&self) -> u64 {
        self.clk
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn queue_usage(&self) -> usize {
        self.cmd_queue.queue_usage()
    }

    fn is_dist(&self) -> bool {
        matches!(
            self.queues,
            TransQueues::DistUnified { .. } | TransQueues::DistSplit { .. }
        )
    }

    /// whether the centralized ingress queue has room for one more
    /// transaction of this kind
    pub fn will_accept_transaction(&self, _hex_addr: u64, is_write: bool) -> bool {
        let cap = self.config.trans_queue_size;
        match &self.queues {
            TransQueues::CentralUnified { unified } => unified.len() < cap,
            TransQueues::CentralSplit { reads, writes } => {
                if is_write {
                    writes.len() < cap
                } else {
                    reads.len() < cap
                }
            }
            _ => panic!("distributed controllers take the requester-qualified accessor"),
        }
    }

    /// distributed variant: check the requester's own queue
    pub fn will_accept_transaction_from(
        &self,
        _hex_addr: u64,
        requester: usize,
        is_write: bool,
    ) -> bool {
        let cap = self.config.dist_trans_queue_size;
        match &self.queues {
            TransQueues::DistUnified { requesters, .. } => requesters[requester].len() < cap,
            TransQueues::DistSplit {
                read_requesters,
                write_requesters,
                ..
            } => {
                if is_write {
                    write_requesters[requester].len() < cap
                } else {
                    read_requesters[requester].len() < cap
                }
            }
            _ => panic!("requester-qualified accessor on a centralized controller"),
        }
    }

    /// accept a transaction the matching `will_accept_*` approved
    /// this same cycle
    pub fn add_transaction(&mut self, mut trans: Transaction) -> bool {
        trans.added_cycle = self.clk;
        self.stats
            .add_value("interarrival_latency", self.clk - self.last_trans_clk);
        self.stats
            .add_value("stall_latency", self.clk - trans.start_cycle);
        if trans.is_write {
            self.stats
                .add_value("write_stall_latency", self.clk - trans.start_cycle);
        } else {
            self.stats
                .add_value("read_stall_latency", self.clk - trans.start_cycle);
        }
        self.last_trans_clk = self.clk;

        match &mut self.queues {
            // distributed ingress only fills the requester queue; the
            // pending and return bookkeeping happens at promotion so
            // the link-latency phase is measured correctly
            TransQueues::DistUnified { requesters, .. } => {
                requesters[trans.requester].push_back(trans);
            }
            TransQueues::DistSplit {
                read_requesters,
                write_requesters,
                ..
            } => {
                if trans.is_write {
                    write_requesters[trans.requester].push_back(trans);
                } else {
                    read_requesters[trans.requester].push_back(trans);
                }
            }
            TransQueues::CentralUnified { unified } => {
                central_ingress(
                    unified,
                    None,
                    trans,
                    self.clk,
                    &mut self.pending_rd,
                    &mut self.pending_wr,
                    &mut self.return_queue,
                    &mut self.stats,
                );
            }
            TransQueues::CentralSplit { reads, writes } => {
                central_ingress(
                    reads,
                    Some(writes),
                    trans,
                    self.clk,
                    &mut self.pending_rd,
                    &mut self.pending_wr,
                    &mut self.return_queue,
                    &mut self.stats,
                );
            }
        }
        true
    }

    /// advance one cycle. the step order is strict: refresh, command
    /// issue, power accounting, self-refresh transitions, queue
    /// promotion, transaction scheduling, clock increment.
    pub fn clock_tick(&mut self) -> Result<()> {
        self.channel_state.tick_refresh();

        let mut cmd = None;
        if self.channel_state.is_refresh_waiting() {
            cmd = self
                .cmd_queue
                .finish_refresh(&self.channel_state, self.clk);
        }
        if cmd.is_none() {
            cmd = self
                .cmd_queue
                .get_command_to_issue(&self.channel_state, self.clk);
        }

        let mut cmd_issued = false;
        if let Some(cmd) = cmd {
            self.issue_command(cmd)?;
            cmd_issued = true;

            if self.config.enable_hbm_dual_cmd {
                if let Some(second) = self
                    .cmd_queue
                    .get_command_to_issue(&self.channel_state, self.clk)
                {
                    let opposite = cmd.cmd_type.is_read_write()
                        && second.cmd_type.is_read_write()
                        && second.is_write() != cmd.is_write();
                    if opposite {
                        self.issue_command(second)?;
                        self.stats.inc("hbm_dual_cmds");
                    } else if second.cmd_type.is_read_write() {
                        // column commands were dequeued; put the
                        // unissued one back at its bank's head
                        self.cmd_queue.unget(second);
                    }
                }
            }
        }

        for rank in 0..self.config.ranks {
            if self.channel_state.is_rank_self_refreshing(rank) {
                self.stats.inc_vec("sref_cycles", rank);
            } else if self.channel_state.is_all_bank_idle_in_rank(rank) {
                self.stats.inc_vec("all_bank_idle_cycles", rank);
                self.channel_state.rank_idle_cycles[rank] += 1;
            } else {
                self.stats.inc_vec("rank_active_cycles", rank);
                self.channel_state.rank_idle_cycles[rank] = 0;
            }
        }

        if self.config.enable_self_refresh && !cmd_issued {
            for rank in 0..self.config.ranks {
                if self.channel_state.is_rank_self_refreshing(rank) {
                    // wake up once work shows up for this rank
                    if !self.cmd_queue.rank_q_empty[rank] {
                        let exit =
                            Command::new(CommandType::SrefExit, Address::rank_only(rank), 0);
                        if let Some(exit) = self.channel_state.get_ready_command(&exit, self.clk) {
                            self.issue_command(exit)?;
                            break;
                        }
                    }
                } else if self.cmd_queue.rank_q_empty[rank]
                    && self.channel_state.rank_idle_cycles[rank] >= self.config.sref_threshold
                {
                    let enter = Command::new(CommandType::SrefEnter, Address::rank_only(rank), 0);
                    if let Some(enter) = self.channel_state.get_ready_command(&enter, self.clk) {
                        self.issue_command(enter)?;
                        break;
                    }
                }
            }
        }

        if self.is_dist() {
            self.queue_in()?;
        }
        self.schedule_transaction();
        self.clk += 1;
        self.cmd_queue.clock_tick();
        self.stats.inc("num_cycles");
        Ok(())
    }

    /// promote transactions from the per-requester queues into the
    /// shared stage, round-robin, at most one read and one write per
    /// cycle
    fn queue_in(&mut self) -> Result<()> {
        let requesters_per_channel = self.config.requesters_per_channel;
        match &mut self.queues {
            TransQueues::DistUnified {
                requesters,
                shared,
                last_requester,
            } => {
                if !shared.is_empty() {
                    return Ok(());
                }
                for i in 0..requesters_per_channel {
                    let requester = (*last_requester + 1 + i) % requesters_per_channel;
                    let Some(mut trans) = requesters[requester].pop_front() else {
                        continue;
                    };
                    if trans.is_write {
                        if !self.pending_wr.contains_key(&trans.addr) {
                            let mut queued = trans.clone();
                            queued.dist_link_start = self.clk;
                            self.pending_wr.insert(queued.addr, queued.clone());
                            shared.push_back(queued);
                        }
                        trans.complete_cycle = self.clk + 1;
                        self.return_queue.push(trans);
                    } else if self.pending_wr.contains_key(&trans.addr) {
                        // served from the write buffer, skips the link
                        self.stats.inc("num_write_buf_hits");
                        trans.complete_cycle = self.clk + 1;
                        self.return_queue.push(trans);
                    } else {
                        trans.dist_link_start = self.clk;
                        let entry = self.pending_rd.entry(trans.addr).or_default();
                        entry.push(trans.clone());
                        if entry.len() == 1 {
                            shared.push_back(trans);
                        }
                    }
                    *last_requester = requester;
                    break;
                }
            }
            TransQueues::DistSplit {
                read_requesters,
                write_requesters,
                per_bank_reads,
                shared_writes,
                last_read_requester,
                last_write_requester,
            } => {
                let mut write_done = shared_writes.len() >= DIST_WRITE_BUFFER_SIZE;
                let mut read_done = per_bank_reads.iter().all(|stage| !stage.is_empty());
                if write_done && read_done {
                    return Ok(());
                }
                for i in 0..requesters_per_channel {
                    let write_requester =
                        (*last_write_requester + 1 + i) % requesters_per_channel;
                    if !write_done && !write_requesters[write_requester].is_empty() {
                        let mut trans =
                            write_requesters[write_requester].pop_front().expect("nonempty");
                        if !self.pending_wr.contains_key(&trans.addr) {
                            let mut queued = trans.clone();
                            queued.dist_link_start = self.clk;
                            self.pending_wr.insert(queued.addr, queued.clone());
                            shared_writes.push_back(queued);
                        }
                        trans.complete_cycle = self.clk + 1;
                        self.return_queue.push(trans);
                        *last_write_requester = write_requester;
                        write_done = true;
                    }

                    let read_requester =
                        (*last_read_requester + 1 + i) % requesters_per_channel;
                    if !read_done && !read_requesters[read_requester].is_empty() {
                        let hex_addr = read_requesters[read_requester]
                            .front()
                            .expect("nonempty")
                            .addr;
                        if self.pending_wr.contains_key(&hex_addr) {
                            let mut trans =
                                read_requesters[read_requester].pop_front().expect("nonempty");
                            self.stats.inc("num_write_buf_hits");
                            trans.complete_cycle = self.clk + 1;
                            self.return_queue.push(trans);
                            *last_read_requester = read_requester;
                            read_done = true;
                        } else {
                            let addr = self.config.address_mapping(hex_addr);
                            let bank_idx =
                                addr.bankgroup * self.config.banks_per_group + addr.bank;
                            // a full stage skips this requester, the
                            // rotor tries the next one
                            if per_bank_reads[bank_idx].is_empty() {
                                let mut trans = read_requesters[read_requester]
                                    .pop_front()
                                    .expect("nonempty");
                                trans.dist_link_start = self.clk;
                                let entry = self.pending_rd.entry(trans.addr).or_default();
                                entry.push(trans.clone());
                                if entry.len() == 1 {
                                    per_bank_reads[bank_idx].push_back(trans);
                                }
                                ensure!(
                                    per_bank_reads[bank_idx].len() <= 1,
                                    "per-bank read stage overflow at bank {}",
                                    bank_idx
                                );
                                *last_read_requester = read_requester;
                                read_done = true;
                            }
                        }
                    }

                    if write_done && read_done {
                        break;
                    }
                }
            }
            _ => unreachable!("queue_in only runs on distributed controllers"),
        }
        Ok(())
    }

    /// pick the source queue per the write-drain state and hand at
    /// most one transaction's command to the command queue
    fn schedule_transaction(&mut self) {
        // drain trigger: buffer full, or nonempty-enough while the
        // command queue has gone idle (split layouts only)
        if self.write_draining == 0 {
            let buffered = match &self.queues {
                TransQueues::CentralSplit { writes, .. } => {
                    let full = writes.len() >= self.config.trans_queue_size;
                    (full
                        || (writes.len() > WRITE_DRAIN_LOW_WATERMARK
                            && self.cmd_queue.queue_empty()))
                    .then_some(writes.len())
                }
                TransQueues::DistSplit { shared_writes, .. } => {
                    let full = shared_writes.len() >= DIST_WRITE_BUFFER_SIZE;
                    (full
                        || (shared_writes.len() > WRITE_DRAIN_LOW_WATERMARK
                            && self.cmd_queue.queue_empty()))
                    .then_some(shared_writes.len())
                }
                _ => None,
            };
            if let Some(buffered) = buffered {
                self.write_draining = buffered;
            }
        }

        let mut ctx = EmitCtx {
            clk: self.clk,
            config: &self.config,
            row_buf_policy: self.row_buf_policy,
            cmd_queue: &mut self.cmd_queue,
            pending_rd: &mut self.pending_rd,
            pending_wr: &mut self.pending_wr,
            stats: &mut self.stats,
            write_draining: &mut self.write_draining,
        };
        match &mut self.queues {
            TransQueues::CentralUnified { unified } => {
                emit_one(&mut ctx, unified, None, false);
            }
            TransQueues::CentralSplit { reads, writes } => {
                let drained =
                    *ctx.write_draining > 0 && emit_one(&mut ctx, writes, None, true);
                // an aborted drain hands its cycle to the read side so
                // the blocking read can clear its pending entry
                if !drained && *ctx.write_draining == 0 {
                    emit_one(&mut ctx, reads, None, false);
                }
            }
            TransQueues::DistUnified { shared, .. } => {
                let link_latency = ctx.config.link_latency;
                emit_one(&mut ctx, shared, Some(link_latency), false);
            }
            TransQueues::DistSplit {
                shared_writes,
                per_bank_reads,
                ..
            } => {
                let link_latency = ctx.config.link_latency;
                let drained = *ctx.write_draining > 0
                    && emit_one(&mut ctx, shared_writes, Some(link_latency), true);
                if !drained && *ctx.write_draining == 0 {
                    for stage in per_bank_reads.iter_mut() {
                        if stage.is_empty() {
                            continue;
                        }
                        if emit_one(&mut ctx, stage, Some(link_latency), false) {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// a command is on the bus this cycle: complete pending reads,
    /// retire the pending write, record per-command stats, then let
    /// the channel state advance its FSMs
    fn issue_command(&mut self, cmd: Command) -> Result<()> {
        if let Some(trace) = &mut self.cmd_trace {
            writeln!(trace, "{:<18} {}", self.clk, cmd)?;
        }
        if let Some(thermal) = &mut self.thermal {
            thermal.update_cmd_power(self.channel_id, &cmd, self.clk);
        }

        if cmd.is_read() {
            let Some(reads) = self.pending_rd.remove(&cmd.hex_addr) else {
                bail!(
                    "READ issued for {:#x} with no pending read",
                    cmd.hex_addr
                );
            };
            // every coalesced read at this address completes together
            for mut req in reads {
                req.issue_cycle = self.clk;
                let latency = self.clk - req.schedule_cycle;
                self.stats.add_value("queuing_latency", latency);
                self.stats.add_value("read_queuing_latency", latency);
                req.complete_cycle = self.clk + self.config.read_delay;
                self.return_queue.push(req);
            }
        } else if cmd.is_write() {
            let Some(mut req) = self.pending_wr.remove(&cmd.hex_addr) else {
                bail!(
                    "WRITE issued for {:#x} with no pending write",
                    cmd.hex_addr
                );
            };
            req.issue_cycle = self.clk;
            let latency = self.clk - req.schedule_cycle;
            self.stats.add_value("queuing_latency", latency);
            self.stats.add_value("write_queuing_latency", latency);
            self.stats.add_value(
                "write_latency",
                self.clk - req.added_cycle + self.config.write_delay,
            );
            self.stats.add_value(
                "total_write_latency",
                self.clk - req.start_cycle + self.config.write_delay,
            );
            // the caller-facing completion was queued at ingress
        }

        // stats read the row-hit state the command sees, so they run
        // before the state update
        self.update_command_stats(&cmd);
        self.channel_state.update_timing_and_states(&cmd, self.clk);
        Ok(())
    }

    fn update_command_stats(&mut self, cmd: &Command) {
        match cmd.cmd_type {
            CommandType::Read | CommandType::ReadPrecharge => {
                self.stats.inc("num_read_cmds");
                if self
                    .channel_state
                    .row_hit_count(cmd.rank(), cmd.bankgroup(), cmd.bank())
                    != 0
                {
                    self.stats.inc("num_row_hits");
                    self.stats.inc("num_read_row_hits");
                }
            }
            CommandType::Write | CommandType::WritePrecharge => {
                self.stats.inc("num_write_cmds");
                if self
                    .channel_state
                    .row_hit_count(cmd.rank(), cmd.bankgroup(), cmd.bank())
                    != 0
                {
                    self.stats.inc("num_row_hits");
                    self.stats.inc("num_write_row_hits");
                }
            }
            CommandType::Activate => self.stats.inc("num_act_cmds"),
            CommandType::Precharge => self.stats.inc("num_pre_cmds"),
            CommandType::Refresh => self.stats.inc("num_ref_cmds"),
            CommandType::RefreshBank => self.stats.inc("num_refb_cmds"),
            CommandType::SrefEnter => self.stats.inc("num_srefe_cmds"),
            CommandType::SrefExit => self.stats.inc("num_srefx_cmds"),
        }
    }

    /// hand back the first completed transaction whose data delay
    /// (plus the reply link in distributed mode) has elapsed
    pub fn return_done_trans(&mut self, clk: u64) -> Option<(u64, bool)> {
        let link_latency = if self.is_dist() {
            self.config.link_latency
        } else {
            0
        };
        let position = self
            .return_queue
            .iter()
            .position(|trans| clk >= trans.complete_cycle + link_latency)?;
        let trans = self.return_queue.remove(position);
        if trans.is_write {
            self.stats.inc("num_writes_done");
        } else {
            self.stats.inc("num_reads_done");
            self.stats
                .add_value("read_latency", self.clk - trans.added_cycle);
            self.stats
                .add_value("total_read_latency", self.clk - trans.start_cycle);
        }
        Some((trans.addr, trans.is_write))
    }

    pub fn print_epoch_stats(&mut self, w: &mut dyn Write) -> Result<()> {
        self.stats.inc("epoch_num");
        self.stats
            .pre_epoch_compute(self.clk, self.cmd_queue.queue_usage() as f64);
        self.stats.print_epoch(w)?;
        if let Some(csv) = &mut self.stats_csv {
            self.stats.csv_row_epoch(csv)?;
        }
        if let Some(thermal) = &mut self.thermal {
            for rank in 0..self.config.ranks {
                thermal.update_background_energy(
                    self.channel_id,
                    rank,
                    self.stats.rank_background_energy(rank),
                );
            }
        }
        self.stats.update_epoch(self.clk);
        Ok(())
    }

    pub fn print_final_stats(&mut self, w: &mut dyn Write) -> Result<()> {
        self.stats
            .pre_epoch_compute(self.clk, self.cmd_queue.queue_usage() as f64);
        self.stats.print_final(w)?;
        if let Some(csv) = &mut self.stats_csv {
            self.stats.csv_row_final(csv)?;
        }
        if let Some(thermal) = &mut self.thermal {
            for rank in 0..self.config.ranks {
                thermal.update_background_energy(
                    self.channel_id,
                    rank,
                    self.stats.rank_background_energy(rank),
                );
            }
        }
        Ok(())
    }
}

/// centralized ingress: write merge, read coalesce and write
/// forwarding happen at acceptance. `writes` is `None` for the
/// unified layout, where both kinds share one queue.
#[allow(clippy::too_many_arguments)]
fn central_ingress(
    reads_or_unified: &mut VecDeque<Transaction>,
    writes: Option<&mut VecDeque<Transaction>>,
    mut trans: Transaction,
    clk: u64,
    pending_rd: &mut HashMap<u64, Vec<Transaction>>,
    pending_wr: &mut HashMap<u64, Transaction>,
    return_queue: &mut Vec<Transaction>,
    stats: &mut Statistics,
) {
    if trans.is_write {
        // duplicate writes to one address merge into the pending one
        if !pending_wr.contains_key(&trans.addr) {
            pending_wr.insert(trans.addr, trans.clone());
            match writes {
                Some(writes) => writes.push_back(trans.clone()),
                None => reads_or_unified.push_back(trans.clone()),
            }
        }
        // the caller sees every write complete on the next cycle
        trans.complete_cycle = clk + 1;
        return_queue.push(trans);
    } else if pending_wr.contains_key(&trans.addr) {
        // read served from the write buffer, no DRAM command
        stats.inc("num_write_buf_hits");
        trans.complete_cycle = clk + 1;
        return_queue.push(trans);
    } else {
        let entry = pending_rd.entry(trans.addr).or_default();
        entry.push(trans.clone());
        // only the first read per address enters the queue; later
        // ones coalesce onto it
        if entry.len() == 1 {
            reads_or_unified.push_back(trans);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: Config) -> Controller {
        Controller::new(0, Arc::new(config), None).unwrap()
    }

    fn tick_until_return(ctrl: &mut Controller, limit: u64) -> (u64, bool) {
        for _ in 0..limit {
            ctrl.clock_tick().unwrap();
            if let Some(done) = ctrl.return_done_trans(ctrl.clk()) {
                return done;
            }
        }
        panic!("no transaction returned within {} cycles", limit);
    }

    fn collect_returns(ctrl: &mut Controller, count: usize, limit: u64) -> Vec<(u64, bool)> {
        let mut done = Vec::new();
        for _ in 0..limit {
            ctrl.clock_tick().unwrap();
            while let Some(ret) = ctrl.return_done_trans(ctrl.clk()) {
                done.push(ret);
            }
            if done.len() >= count {
                return done;
            }
        }
        panic!("only {}/{} transactions returned", done.len(), count);
    }

    #[test]
    fn single_read_open_page() {
        let config = Config::from_ddr4(1, 1);
        let (trcd, read_delay) = (config.trcd, config.read_delay);
        let mut ctrl = controller(config);
        assert!(ctrl.will_accept_transaction(0x1000, false));
        ctrl.add_transaction(Transaction::read(0x1000, 0));

        let (addr, is_write) = tick_until_return(&mut ctrl, 200);
        assert_eq!(addr, 0x1000);
        assert!(!is_write);
        // schedule at 0, ACT at 1, READ tRCD later, data read_delay after
        assert_eq!(ctrl.clk(), 1 + trcd + read_delay);
        assert_eq!(ctrl.stats().counter("num_act_cmds"), 1);
        assert_eq!(ctrl.stats().counter("num_read_cmds"), 1);
        assert_eq!(ctrl.stats().counter("num_reads_done"), 1);
        assert!(ctrl.pending_rd.is_empty());
    }

    #[test]
    fn close_page_reads_reactivate_every_time() {
        let mut config = Config::from_ddr4(1, 1);
        config.row_buf_policy = RowBufPolicy::ClosePage;
        let mut ctrl = controller(config);
        ctrl.add_transaction(Transaction::read(0x40, 0));
        tick_until_return(&mut ctrl, 200);
        ctrl.add_transaction(Transaction::read(0x80, ctrl.clk()));
        tick_until_return(&mut ctrl, 200);
        // same row, but the implicit precharge closed it
        assert_eq!(ctrl.stats().counter("num_act_cmds"), 2);
        assert_eq!(ctrl.stats().counter("num_read_cmds"), 2);
        assert_eq!(ctrl.stats().counter("num_read_row_hits"), 0);
    }

    #[test]
    fn write_then_read_forwards_from_write_buffer() {
        let mut config = Config::from_ddr4(1, 1);
        // capacity 1 so the single write triggers a full-buffer drain
        config.trans_queue_size = 1;
        let mut ctrl = controller(config);

        assert!(ctrl.will_accept_transaction(0x2000, true));
        ctrl.add_transaction(Transaction::write(0x2000, 0));
        ctrl.clock_tick().unwrap();
        // the write completes towards the caller right away
        assert_eq!(ctrl.return_done_trans(ctrl.clk()), Some((0x2000, true)));

        ctrl.add_transaction(Transaction::read(0x2000, 1));
        let read_added_at = ctrl.clk();
        let (addr, is_write) = tick_until_return(&mut ctrl, 200);
        assert_eq!((addr, is_write), (0x2000, false));
        assert_eq!(ctrl.clk(), read_added_at + 1);
        assert_eq!(ctrl.stats().counter("num_write_buf_hits"), 1);

        // only the write ever reaches the DRAM
        for _ in 0..200 {
            ctrl.clock_tick().unwrap();
        }
        assert_eq!(ctrl.stats().counter("num_write_cmds"), 1);
        assert_eq!(ctrl.stats().counter("num_read_cmds"), 0);
        assert!(ctrl.pending_wr.is_empty());
    }

    #[test]
    fn reads_to_one_address_coalesce() {
        let config = Config::from_ddr4(1, 1);
        let mut ctrl = controller(config);
        // three reads arrive before the first READ can issue (tRCD)
        ctrl.add_transaction(Transaction::read(0x3000, 0));
        ctrl.clock_tick().unwrap();
        ctrl.add_transaction(Transaction::read(0x3000, 1));
        ctrl.clock_tick().unwrap();
        ctrl.add_transaction(Transaction::read(0x3000, 2));
        assert_eq!(ctrl.pending_rd[&0x3000].len(), 3);

        let done = collect_returns(&mut ctrl, 3, 200);
        let return_clk = ctrl.clk();
        assert!(done.iter().all(|ret| *ret == (0x3000, false)));
        assert_eq!(ctrl.stats().counter("num_read_cmds"), 1);
        assert_eq!(ctrl.stats().counter("num_reads_done"), 3);
        // identical complete cycles, so all three drained together
        assert_eq!(return_clk, 1 + ctrl.config.trcd + ctrl.config.read_delay);
    }

    #[test]
    fn write_drain_starts_above_low_watermark() {
        let mut config = Config::from_ddr4(1, 1);
        config.trans_queue_size = 16;
        let mut ctrl = controller(config);
        for i in 0..9u64 {
            assert!(ctrl.will_accept_transaction(i << 20, true));
            ctrl.add_transaction(Transaction::write(i << 20, 0));
        }
        ctrl.clock_tick().unwrap();
        // drain armed at 9, one write already emitted
        assert_eq!(ctrl.write_draining, 8);
        assert_eq!(ctrl.cmd_queue.queue_usage(), 1);
    }

    #[test]
    fn pending_read_aborts_write_drain() {
        let mut config = Config::from_ddr4(1, 1);
        config.trans_queue_size = 16;
        let mut ctrl = controller(config);
        ctrl.add_transaction(Transaction::read(0xA000, 0));
        ctrl.add_transaction(Transaction::write(0xA000, 0));
        for i in 1..9u64 {
            ctrl.add_transaction(Transaction::write(i << 20, 0));
        }

        ctrl.clock_tick().unwrap();
        // the drain hit W(0xA000) while R(0xA000) was still pending;
        // the aborted cycle scheduled the read instead and every
        // write stayed buffered
        assert_eq!(ctrl.write_draining, 0);
        assert_eq!(ctrl.stats().counter("num_wr_dependency"), 1);
        assert_eq!(ctrl.cmd_queue.queue_usage(), 1);
        assert_eq!(ctrl.queues.as_central_split().unwrap().1.len(), 9);
        assert_eq!(ctrl.stats().counter("num_write_cmds"), 0);

        // once the read clears, every write drains
        let done = collect_returns(&mut ctrl, 10, 3000);
        assert_eq!(done.iter().filter(|(_, is_write)| *is_write).count(), 9);
        for _ in 0..3000 {
            ctrl.clock_tick().unwrap();
            if ctrl.stats().counter("num_write_cmds") == 9 {
                break;
            }
        }
        assert_eq!(ctrl.stats().counter("num_write_cmds"), 9);
        assert!(ctrl.pending_wr.is_empty());
        assert!(ctrl.pending_rd.is_empty());
    }

    #[test]
    fn duplicate_write_merges_silently() {
        let config = Config::from_ddr4(1, 1);
        let mut ctrl = controller(config);
        ctrl.add_transaction(Transaction::write(0x4000, 0));
        ctrl.add_transaction(Transaction::write(0x4000, 0));
        let writes = ctrl.queues.as_central_split().unwrap().1;
        assert_eq!(writes.len(), 1);
        assert_eq!(ctrl.pending_wr.len(), 1);
        // both callers still see their write complete
        let done = collect_returns(&mut ctrl, 2, 10);
        assert!(done.iter().all(|ret| *ret == (0x4000, true)));
    }

    #[test]
    fn ingress_queue_respects_capacity() {
        let mut config = Config::from_ddr4(1, 1);
        config.trans_queue_size = 2;
        let mut ctrl = controller(config);
        ctrl.add_transaction(Transaction::read(0x40, 0));
        ctrl.add_transaction(Transaction::read(0x80, 0));
        assert!(!ctrl.will_accept_transaction(0xc0, false));
        // writes have their own buffer in the split layout
        assert!(ctrl.will_accept_transaction(0xc0, true));
    }

    #[test]
    fn dist_unified_promotes_round_robin() {
        let mut config = Config::from_ddr4(1, 1);
        config.dist_controller = true;
        config.unified_queue = true;
        config.requesters_per_channel = 4;
        config.dist_trans_queue_size = 4;
        config.link_latency = 0;
        let mut ctrl = controller(config);

        // requester r offers reads 3r..3r+2, all row hits in bank 0
        for requester in 0..4usize {
            for j in 0..3u64 {
                let addr = (requester as u64 * 3 + j + 1) << 6;
                assert!(ctrl.will_accept_transaction_from(addr, requester, false));
                ctrl.add_transaction(Transaction::read(addr, 0).from_requester(requester));
            }
        }

        let done = collect_returns(&mut ctrl, 12, 2000);
        let order: Vec<usize> = done
            .iter()
            .map(|(addr, _)| (((addr >> 6) - 1) / 3) as usize)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(ctrl.stats().counter("num_reads_done"), 12);
    }

    #[test]
    fn link_latency_gates_schedule_and_return() {
        let mut config = Config::from_ddr4(1, 1);
        config.dist_controller = true;
        config.unified_queue = true;
        config.requesters_per_channel = 1;
        config.dist_trans_queue_size = 4;
        config.link_latency = 5;
        let (trcd, read_delay, link) = (config.trcd, config.read_delay, config.link_latency);
        let mut ctrl = controller(config);
        ctrl.add_transaction(Transaction::read(0x40, 0).from_requester(0));

        // promoted at cycle 0, held on the link for 5 cycles
        for _ in 0..5 {
            ctrl.clock_tick().unwrap();
            assert_eq!(ctrl.cmd_queue.queue_usage(), 0);
        }
        let (addr, _) = tick_until_return(&mut ctrl, 200);
        assert_eq!(addr, 0x40);
        // scheduled at link, ACT one cycle later, reply pays the link
        assert_eq!(ctrl.clk(), link + 1 + trcd + read_delay + link);
    }

    #[test]
    fn dist_split_keeps_single_entry_bank_stages() {
        let mut config = Config::from_ddr4(1, 1);
        config.dist_controller = true;
        config.unified_queue = false;
        config.requesters_per_channel = 2;
        config.dist_trans_queue_size = 8;
        config.link_latency = 0;
        let mut ctrl = controller(config);

        ctrl.add_transaction(Transaction::write(0x5000, 0).from_requester(0));
        ctrl.add_transaction(Transaction::read(0x5000, 0).from_requester(1));
        ctrl.add_transaction(Transaction::read(1 << 16, 0).from_requester(0));
        ctrl.add_transaction(Transaction::read(2 << 16, 0).from_requester(1));

        let mut done = Vec::new();
        for _ in 0..500 {
            ctrl.clock_tick().unwrap();
            let (_, _, per_bank_reads, ..) = ctrl.queues.as_dist_split().unwrap();
            assert!(per_bank_reads.iter().all(|stage| stage.len() <= 1));
            while let Some(ret) = ctrl.return_done_trans(ctrl.clk()) {
                done.push(ret);
            }
            if done.len() == 4 {
                break;
            }
        }
        assert_eq!(done.len(), 4);
        // the read behind the pending write was forwarded
        assert_eq!(ctrl.stats().counter("num_write_buf_hits"), 1);
        assert_eq!(ctrl.stats().counter("num_reads_done"), 3);
        assert_eq!(ctrl.stats().counter("num_writes_done"), 1);
    }

    #[test]
    fn dist_split_drains_writes_once_buffered() {
        let mut config = Config::from_ddr4(1, 1);
        config.dist_controller = true;
        config.unified_queue = false;
        config.requesters_per_channel = 2;
        config.dist_trans_queue_size = 8;
        config.link_latency = 0;
        let mut ctrl = controller(config);
        // nine writes buffer up past the low watermark, then drain
        for i in 0..9u64 {
            let requester = (i % 2) as usize;
            ctrl.add_transaction(Transaction::write(i << 20, 0).from_requester(requester));
        }
        let done = collect_returns(&mut ctrl, 9, 2000);
        assert!(done.iter().all(|(_, is_write)| *is_write));
        for _ in 0..2000 {
            ctrl.clock_tick().unwrap();
            if ctrl.stats().counter("num_write_cmds") == 9 {
                break;
            }
        }
        assert_eq!(ctrl.stats().counter("num_write_cmds"), 9);
        assert!(ctrl.pending_wr.is_empty());
    }

    #[test]
    fn hbm_dual_issue_pairs_opposite_column_commands() {
        let mut config = Config::from_ddr4(1, 1);
        config.unified_queue = true;
        config.enable_hbm_dual_cmd = true;
        config.trcd = 1;
        config.tccd = 1;
        let mut ctrl = controller(config);
        // three row hits in bank 0 and a write in bank 1
        ctrl.add_transaction(Transaction::read(0x40, 0));
        ctrl.add_transaction(Transaction::read(0x80, 0));
        ctrl.add_transaction(Transaction::read(0xc0, 0));
        ctrl.add_transaction(Transaction::write(1 << 16, 0));

        for _ in 0..10 {
            ctrl.clock_tick().unwrap();
        }
        assert_eq!(ctrl.stats().counter("hbm_dual_cmds"), 1);
        assert_eq!(ctrl.stats().counter("num_read_cmds"), 3);
        assert_eq!(ctrl.stats().counter("num_write_cmds"), 1);
    }

    #[test]
    fn idle_rank_enters_self_refresh_and_wakes_up() {
        let mut config = Config::from_ddr4(1, 1);
        config.enable_self_refresh = true;
        config.sref_threshold = 10;
        let mut ctrl = controller(config);
        for _ in 0..15 {
            ctrl.clock_tick().unwrap();
        }
        assert_eq!(ctrl.stats().counter("num_srefe_cmds"), 1);
        assert!(ctrl.stats().counter_vec("sref_cycles", 0) > 0);

        ctrl.add_transaction(Transaction::read(0x40, ctrl.clk()));
        let (addr, _) = tick_until_return(&mut ctrl, 1500);
        assert_eq!(addr, 0x40);
        assert_eq!(ctrl.stats().counter("num_srefx_cmds"), 1);
        assert_eq!(ctrl.stats().counter("num_reads_done"), 1);
    }

    #[test]
    fn refresh_interleaves_with_idle_traffic() {
        let config = Config::from_ddr4(1, 1);
        let trefi = config.trefi;
        let mut ctrl = controller(config);
        for _ in 0..trefi + 10 {
            ctrl.clock_tick().unwrap();
        }
        assert_eq!(ctrl.stats().counter("num_ref_cmds"), 1);
    }

    #[test]
    fn epoch_stats_report_deltas() {
        let config = Config::from_ddr4(1, 1);
        let mut ctrl = controller(config);
        for _ in 0..5 {
            ctrl.clock_tick().unwrap();
        }
        let mut first = Vec::new();
        ctrl.print_epoch_stats(&mut first).unwrap();
        for _ in 0..3 {
            ctrl.clock_tick().unwrap();
        }
        let mut second = Vec::new();
        ctrl.print_epoch_stats(&mut second).unwrap();

        let epoch_cycles = |out: &[u8]| {
            let out = String::from_utf8(out.to_vec()).unwrap();
            let line = out
                .lines()
                .find(|line| line.starts_with("num_cycles"))
                .unwrap();
            line.split('=')
                .nth(1)
                .unwrap()
                .split('#')
                .next()
                .unwrap()
                .trim()
                .to_string()
        };
        assert_eq!(epoch_cycles(&first), "5");
        assert_eq!(epoch_cycles(&second), "3");
        assert_eq!(ctrl.stats().counter("epoch_num"), 2);
    }

    #[test]
    fn read_issue_without_pending_entry_is_fatal() {
        let config = Config::from_ddr4(1, 1);
        let mut ctrl = controller(config);
        let cmd = Command::new(
            CommandType::Read,
            ctrl.config.address_mapping(0x999000),
            0x999000,
        );
        assert!(ctrl.issue_command(cmd).is_err());
    }

    #[test]
    fn return_queue_empty_yields_none() {
        let config = Config::from_ddr4(1, 1);
        let mut ctrl = controller(config);
        assert_eq!(ctrl.return_done_trans(100), None);
    }
}
