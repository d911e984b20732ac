//! DRAM commands

use std::fmt::{self, Display, Formatter};

use super::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Read,
    ReadPrecharge,
    Write,
    WritePrecharge,
    Activate,
    Precharge,
    Refresh,
    RefreshBank,
    SrefEnter,
    SrefExit,
}

impl CommandType {
    pub fn is_read(&self) -> bool {
        matches!(self, CommandType::Read | CommandType::ReadPrecharge)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, CommandType::Write | CommandType::WritePrecharge)
    }

    /// a column command that moves data on the bus
    pub fn is_read_write(&self) -> bool {
        self.is_read() || self.is_write()
    }
}

impl Display for CommandType {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        let name = match self {
            CommandType::Read => "READ",
            CommandType::ReadPrecharge => "READ_P",
            CommandType::Write => "WRITE",
            CommandType::WritePrecharge => "WRITE_P",
            CommandType::Activate => "ACT",
            CommandType::Precharge => "PRE",
            CommandType::Refresh => "REF",
            CommandType::RefreshBank => "REFB",
            CommandType::SrefEnter => "SREF_ENTER",
            CommandType::SrefExit => "SREF_EXIT",
        };
        write!(fmt, "{}", name)
    }
}

/// a scheduled DRAM command targeting one bank (or one rank for
/// refresh and self-refresh transitions)
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub cmd_type: CommandType,
    pub addr: Address,
    /// the host address the command was derived from, key into the
    /// pending-transaction maps
    pub hex_addr: u64,
}

impl Command {
    pub fn new(cmd_type: CommandType, addr: Address, hex_addr: u64) -> Self {
        Self {
            cmd_type,
            addr,
            hex_addr,
        }
    }

    pub fn rank(&self) -> usize {
        self.addr.rank
    }

    pub fn bankgroup(&self) -> usize {
        self.addr.bankgroup
    }

    pub fn bank(&self) -> usize {
        self.addr.bank
    }

    pub fn row(&self) -> u64 {
        self.addr.row
    }

    pub fn is_read(&self) -> bool {
        self.cmd_type.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.cmd_type.is_write()
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "{:<10} {:#x} {}",
            self.cmd_type, self.hex_addr, self.addr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_classes() {
        assert!(CommandType::Read.is_read());
        assert!(CommandType::ReadPrecharge.is_read());
        assert!(CommandType::WritePrecharge.is_write());
        assert!(!CommandType::Activate.is_read_write());
        assert!(!CommandType::Refresh.is_read_write());
        assert!(!CommandType::SrefEnter.is_read_write());
    }

    #[test]
    fn trace_line_format() {
        let cmd = Command::new(
            CommandType::Activate,
            Address {
                channel: 0,
                rank: 1,
                bankgroup: 2,
                bank: 3,
                row: 42,
                column: 0,
            },
            0x1000,
        );
        let line = format!("{}", cmd);
        assert!(line.starts_with("ACT"));
        assert!(line.contains("0x1000"));
    }
}
