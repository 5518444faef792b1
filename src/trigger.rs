//! Inputs to handlers: raw chain logs as delivered by a feed, and the decoded
//! triggers that handlers observe.

use crate::value::Value;
use solabi::ethprim::{Address, Digest};
use std::fmt::{self, Display, Formatter};

/// A pointer to a block by number and hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockPtr {
    pub number: u64,
    pub hash: Digest,
}

impl Display for BlockPtr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "#{} (0x{})", self.number, hex::encode(self.hash.0))
    }
}

/// Causal ordering key of a trigger on a chain branch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Position {
    pub block: u64,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl Position {
    pub fn new(block: u64, transaction_index: u64, log_index: u64) -> Self {
        Self {
            block,
            transaction_index,
            log_index,
        }
    }

    /// Position of the `n`-th content trigger of a block. These order after
    /// all logs of the block.
    pub fn content(block: u64, n: u64) -> Self {
        Self::new(block, u64::MAX, n)
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block, self.transaction_index, self.log_index
        )
    }
}

/// An undecoded log emitted by a contract.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<Digest>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_hash: Digest,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl RawLog {
    pub fn position(&self) -> Position {
        Position::new(self.block_number, self.transaction_index, self.log_index)
    }
}

/// A log decoded against the event signature of a registered handler.
#[derive(Clone, Debug, PartialEq)]
pub struct Log {
    pub block: BlockPtr,
    pub timestamp: u64,
    pub transaction_hash: Digest,
    pub position: Position,
    pub address: Address,
    /// The event name, for example `Transfer`.
    pub event: String,
    pub params: Vec<(String, Value)>,
}

impl Log {
    /// The deterministic id for entities derived from exactly this log.
    pub fn id(&self) -> String {
        format!(
            "0x{}-{}",
            hex::encode(self.transaction_hash.0),
            self.position.log_index
        )
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find_map(|(param, value)| (param == name).then_some(value))
    }
}

/// Resolved off-chain content for a watched content source.
#[derive(Clone, Debug, PartialEq)]
pub struct Content {
    pub block: BlockPtr,
    pub position: Position,
    /// The content address (for example an IPFS hash).
    pub hash: String,
    pub payload: Vec<u8>,
}

/// Anything that causes a handler to run.
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    Log(Log),
    Content(Content),
}

impl Trigger {
    pub fn position(&self) -> Position {
        match self {
            Self::Log(log) => log.position,
            Self::Content(content) => content.position,
        }
    }

    pub fn block(&self) -> BlockPtr {
        match self {
            Self::Log(log) => log.block,
            Self::Content(content) => content.block,
        }
    }

    pub fn as_log(&self) -> Option<&Log> {
        match self {
            Self::Log(log) => Some(log),
            Self::Content(_) => None,
        }
    }

    pub fn as_content(&self) -> Option<&Content> {
        match self {
            Self::Content(content) => Some(content),
            Self::Log(_) => None,
        }
    }
}
