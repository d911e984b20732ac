//! decoded DRAM address

use std::fmt::{self, Display, Formatter};

/// a host address decoded into the DRAM hierarchy levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Address {
    pub channel: usize,
    pub rank: usize,
    pub bankgroup: usize,
    pub bank: usize,
    pub row: u64,
    pub column: u64,
}

impl Address {
    pub fn rank_only(rank: usize) -> Self {
        Self {
            rank,
            ..Default::default()
        }
    }
}

impl Display for Address {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "({}, {}, {}, {}, {}, {})",
            self.channel, self.rank, self.bankgroup, self.bank, self.row, self.column
        )
    }
}
