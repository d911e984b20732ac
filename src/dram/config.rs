//! simulator configuration, loaded from a toml file

use std::path::Path;

use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};

use super::address::Address;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DramType {
    DDR3,
    DDR4,
    LPDDR4,
    HBM,
    HBM2,
    HMC,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowBufPolicy {
    OpenPage,
    ClosePage,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    // memory geometry
    pub dram_type: DramType,
    pub channels: usize,
    pub ranks: usize,
    pub bankgroups: usize,
    pub banks_per_group: usize,
    pub rows: u64,
    pub columns: u64,
    /// data bus width in bits
    pub bus_width: u64,
    /// burst length
    pub bl: u64,

    // queue layout
    pub trans_queue_size: usize,
    pub cmd_queue_size: usize,
    pub unified_queue: bool,
    pub dist_controller: bool,
    pub requesters_per_channel: usize,
    pub dist_trans_queue_size: usize,

    // policy
    pub row_buf_policy: RowBufPolicy,
    pub enable_self_refresh: bool,
    pub sref_threshold: u64,
    pub enable_hbm_dual_cmd: bool,
    /// wire delay between a requester's local queue and the shared
    /// channel stage (distributed mode)
    pub link_latency: u64,
    pub enable_cmd_trace: bool,

    // timing, in DRAM cycles unless noted
    /// clock period in ns
    pub tck: f64,
    pub trcd: u64,
    pub trp: u64,
    pub tras: u64,
    pub tccd: u64,
    pub trfc: u64,
    pub trefi: u64,
    pub tckesr: u64,
    pub txs: u64,
    /// cycles from READ issue until data is available (CL + BL/2)
    pub read_delay: u64,
    /// cycles from WRITE issue until data is written (CWL + BL/2)
    pub write_delay: u64,

    // energy increments, pJ per event / per cycle
    pub act_energy_inc: f64,
    pub read_energy_inc: f64,
    pub write_energy_inc: f64,
    pub ref_energy_inc: f64,
    pub refb_energy_inc: f64,
    pub act_stb_energy_inc: f64,
    pub pre_stb_energy_inc: f64,
    pub pre_pd_energy_inc: f64,
    pub sref_energy_inc: f64,

    // output
    pub output_prefix: String,
    pub output_path: String,
    pub epoch_period: u64,
}

impl Config {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = toml::from_str(std::fs::read_to_string(path)?.as_str())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// all address-mapping fields must be powers of two
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("channels", self.channels as u64),
            ("ranks", self.ranks as u64),
            ("bankgroups", self.bankgroups as u64),
            ("banks_per_group", self.banks_per_group as u64),
            ("rows", self.rows),
            ("columns", self.columns),
        ] {
            ensure!(v.is_power_of_two(), "{} must be a power of two, got {}", name, v);
        }
        ensure!(
            self.requesters_per_channel > 0,
            "requesters_per_channel must be nonzero"
        );
        ensure!(self.trefi > self.trfc, "tREFI must exceed tRFC");
        Ok(())
    }

    pub fn banks_per_channel(&self) -> usize {
        self.bankgroups * self.banks_per_group
    }

    /// bytes moved by one read or write burst
    pub fn request_size_bytes(&self) -> u64 {
        self.bus_width / 8 * self.bl
    }

    pub fn is_hmc(&self) -> bool {
        self.dram_type == DramType::HMC
    }

    /// deterministic host-address decode. field order from low to
    /// high bits: block offset, column, channel, bank, bankgroup,
    /// rank, row.
    pub fn address_mapping(&self, hex_addr: u64) -> Address {
        let mut addr = hex_addr >> self.request_size_bytes().trailing_zeros();
        let mut take = |size: u64| {
            let field = addr & (size - 1);
            addr >>= size.trailing_zeros();
            field
        };
        let column = take(self.columns);
        let channel = take(self.channels as u64) as usize;
        let bank = take(self.banks_per_group as u64) as usize;
        let bankgroup = take(self.bankgroups as u64) as usize;
        let rank = take(self.ranks as u64) as usize;
        let row = addr & (self.rows - 1);
        Address {
            channel,
            rank,
            bankgroup,
            bank,
            row,
            column,
        }
    }

    /// a small DDR4-2400-like device, the default for tests and demos
    pub fn from_ddr4(channels: usize, ranks: usize) -> Self {
        Self {
            dram_type: DramType::DDR4,
            channels,
            ranks,
            bankgroups: 4,
            banks_per_group: 4,
            rows: 32768,
            columns: 1024,
            bus_width: 64,
            bl: 8,
            trans_queue_size: 32,
            cmd_queue_size: 8,
            unified_queue: false,
            dist_controller: false,
            requesters_per_channel: 1,
            dist_trans_queue_size: 16,
            row_buf_policy: RowBufPolicy::OpenPage,
            enable_self_refresh: false,
            sref_threshold: 1000,
            enable_hbm_dual_cmd: false,
            link_latency: 0,
            enable_cmd_trace: false,
            tck: 0.83,
            trcd: 16,
            trp: 16,
            tras: 39,
            tccd: 6,
            trfc: 420,
            trefi: 9360,
            tckesr: 12,
            txs: 432,
            read_delay: 20,
            write_delay: 16,
            act_energy_inc: 2100.0,
            read_energy_inc: 3500.0,
            write_energy_inc: 3600.0,
            ref_energy_inc: 45000.0,
            refb_energy_inc: 2800.0,
            act_stb_energy_inc: 90.0,
            pre_stb_energy_inc: 70.0,
            pre_pd_energy_inc: 50.0,
            sref_energy_inc: 35.0,
            output_prefix: String::new(),
            output_path: String::new(),
            epoch_period: 100000,
        }
    }

    /// HBM2 pseudochannel pair with dual command issue
    pub fn from_hbm2(channels: usize) -> Self {
        Self {
            dram_type: DramType::HBM2,
            channels,
            ranks: 1,
            bankgroups: 4,
            banks_per_group: 4,
            rows: 16384,
            columns: 64,
            bus_width: 128,
            bl: 4,
            enable_hbm_dual_cmd: true,
            trcd: 14,
            trp: 14,
            tras: 33,
            tccd: 2,
            trfc: 260,
            trefi: 3900,
            read_delay: 16,
            write_delay: 8,
            ..Self::from_ddr4(channels, 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let config = Config::from_ddr4(2, 2);
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.channels, 2);
        assert_eq!(back.row_buf_policy, RowBufPolicy::OpenPage);
        back.validate().unwrap();
    }

    #[test]
    fn row_buf_policy_names() {
        let policy: RowBufPolicy = toml::from_str::<toml::Value>("v = \"CLOSE_PAGE\"")
            .unwrap()
            .get("v")
            .unwrap()
            .clone()
            .try_into()
            .unwrap();
        assert_eq!(policy, RowBufPolicy::ClosePage);
    }

    #[test]
    fn address_mapping_fields() {
        let config = Config::from_ddr4(1, 2);
        // request size 64B -> 6 offset bits, then 10 column bits
        let addr = config.address_mapping(0x40);
        assert_eq!(addr.column, 1);
        assert_eq!(addr.bank, 0);
        let addr = config.address_mapping(1 << 16);
        assert_eq!(addr.column, 0);
        assert_eq!(addr.bank, 1);
        // distinct addresses land on distinct decoded tuples
        let a = config.address_mapping(0x1000);
        let b = config.address_mapping(0x2000);
        assert_ne!(a, b);
    }

    #[test]
    fn validate_rejects_non_power_of_two() {
        let mut config = Config::from_ddr4(1, 1);
        config.rows = 1000;
        assert!(config.validate().is_err());
    }
}
