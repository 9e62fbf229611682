//! Command encoder
//!
//! Builds the fixed-size command descriptor block for each operation the
//! engine issues. Multi-byte fields are big-endian per SBC-3.

use serde::Serialize;
use std::fmt;

/// TEST UNIT READY
pub const OP_TEST_UNIT_READY: u8 = 0x00;
/// READ(16)
pub const OP_READ_16: u8 = 0x88;
/// WRITE(16)
pub const OP_WRITE_16: u8 = 0x8a;
/// SERVICE ACTION IN(16); READ CAPACITY(16) is service action 0x10
pub const OP_SERVICE_ACTION_IN_16: u8 = 0x9e;
/// READ CAPACITY(16) service action
pub const SA_READ_CAPACITY_16: u8 = 0x10;
/// Bytes returned by READ CAPACITY(16) that the engine reads.
pub const READ_CAPACITY_16_LEN: u32 = 32;

/// Largest CDB the engine builds.
pub const MAX_CDB_LEN: usize = 16;

/// Operation class driven by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// TEST UNIT READY, no data.
    #[default]
    NoOp,
    /// READ(16) into the request buffer.
    Read,
    /// WRITE(16) from the request buffer.
    Write,
}

impl OpKind {
    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    /// Whether the operation addresses blocks (and needs an LBA generator).
    pub fn needs_lba(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Data direction.
    pub fn direction(self) -> Direction {
        match self {
            Self::NoOp => Direction::None,
            Self::Read => Direction::FromDevice,
            Self::Write => Direction::ToDevice,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Data transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// No data phase.
    None,
    /// Data-out.
    ToDevice,
    /// Data-in.
    FromDevice,
}

/// An immutable, encoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    bytes: [u8; MAX_CDB_LEN],
    len: u8,
    direction: Direction,
    xfer_len: u32,
    name: &'static str,
}

impl Command {
    /// TEST UNIT READY.
    pub fn no_op() -> Self {
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[0] = OP_TEST_UNIT_READY;
        Self {
            bytes,
            len: 6,
            direction: Direction::None,
            xfer_len: 0,
            name: OpKind::NoOp.name(),
        }
    }

    /// READ(16) of `blocks` blocks at `lba`.
    pub fn read(lba: u64, blocks: u32, block_size: u32) -> Self {
        Self::rw16(OP_READ_16, lba, blocks, block_size, Direction::FromDevice, OpKind::Read)
    }

    /// WRITE(16) of `blocks` blocks at `lba`.
    pub fn write(lba: u64, blocks: u32, block_size: u32) -> Self {
        Self::rw16(OP_WRITE_16, lba, blocks, block_size, Direction::ToDevice, OpKind::Write)
    }

    /// READ CAPACITY(16).
    pub fn read_capacity() -> Self {
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[0] = OP_SERVICE_ACTION_IN_16;
        bytes[1] = SA_READ_CAPACITY_16;
        bytes[10..14].copy_from_slice(&READ_CAPACITY_16_LEN.to_be_bytes());
        Self {
            bytes,
            len: 16,
            direction: Direction::FromDevice,
            xfer_len: READ_CAPACITY_16_LEN,
            name: "read capacity",
        }
    }

    /// Build the command `op` issues at `lba`.
    pub fn for_op(op: OpKind, lba: u64, blocks: u32, block_size: u32) -> Self {
        match op {
            OpKind::NoOp => Self::no_op(),
            OpKind::Read => Self::read(lba, blocks, block_size),
            OpKind::Write => Self::write(lba, blocks, block_size),
        }
    }

    fn rw16(
        opcode: u8,
        lba: u64,
        blocks: u32,
        block_size: u32,
        direction: Direction,
        op: OpKind,
    ) -> Self {
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[0] = opcode;
        bytes[2..10].copy_from_slice(&lba.to_be_bytes());
        bytes[10..14].copy_from_slice(&blocks.to_be_bytes());
        Self {
            bytes,
            len: 16,
            direction,
            xfer_len: blocks.saturating_mul(block_size),
            name: op.name(),
        }
    }

    /// CDB bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Transfer direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Transfer length in bytes.
    pub fn xfer_len(&self) -> u32 {
        self.xfer_len
    }

    /// Operation name for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Decoded fields of a READ(16)/WRITE(16) CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rw16 {
    /// Starting LBA.
    pub lba: u64,
    /// Number of blocks.
    pub blocks: u32,
}

/// Decode the LBA and block count of a 16-byte read/write CDB.
pub fn decode_rw16(cdb: &[u8]) -> Option<Rw16> {
    if cdb.len() < 16 || !matches!(cdb[0], OP_READ_16 | OP_WRITE_16) {
        return None;
    }
    let lba = u64::from_be_bytes(cdb[2..10].try_into().ok()?);
    let blocks = u32::from_be_bytes(cdb[10..14].try_into().ok()?);
    Some(Rw16 { lba, blocks })
}

/// Capacity as reported by READ CAPACITY(16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    /// Number of logical blocks (last LBA + 1).
    pub blocks: u64,
    /// Logical block length in bytes.
    pub block_size: u32,
}

impl Capacity {
    /// Parse READ CAPACITY(16) parameter data.
    pub fn from_response(resp: &[u8]) -> Option<Self> {
        if resp.len() < 12 {
            return None;
        }
        let last_lba = u64::from_be_bytes(resp[0..8].try_into().ok()?);
        let block_size = u32::from_be_bytes(resp[8..12].try_into().ok()?);
        Some(Self {
            blocks: last_lba.checked_add(1)?,
            block_size,
        })
    }

    /// Encode as READ CAPACITY(16) parameter data.
    pub fn encode(&self, out: &mut [u8]) {
        let n = out.len().min(READ_CAPACITY_16_LEN as usize);
        out[..n].fill(0);
        if n >= 12 {
            out[0..8].copy_from_slice(&self.blocks.saturating_sub(1).to_be_bytes());
            out[8..12].copy_from_slice(&self.block_size.to_be_bytes());
        }
    }
}
