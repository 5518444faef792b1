//! Event source adapters. A [`Feed`] turns a blockchain into an ordered,
//! replayable stream of blocks with the logs of all watched addresses, and
//! reports chain reorganizations.

mod chain;
mod rpc;
mod scripted;

pub use self::{rpc::Rpc, scripted::Scripted};
use crate::trigger::{BlockPtr, RawLog};
use anyhow::Result;
use futures::future::BoxFuture;
use solabi::ethprim::{Address, Digest};

/// A block with the logs of watched addresses.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Block {
    pub number: u64,
    pub hash: Digest,
    pub parent_hash: Digest,
    pub timestamp: u64,
    pub logs: Vec<RawLog>,
}

impl Block {
    pub fn ptr(&self) -> BlockPtr {
        BlockPtr {
            number: self.number,
            hash: self.hash,
        }
    }
}

/// An update from a feed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Update {
    Block(Block),
    /// The canonical chain diverged at block `fork`: every block from `fork`
    /// onwards that was delivered before is no longer canonical. Blocks of the
    /// new branch follow, starting at `fork`.
    Reorg { fork: u64, head: u64 },
}

pub trait Feed {
    /// Retrieves the next update. Returns `None` if there is currently no new
    /// data, in which case the caller is expected to poll again later.
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Update>>>;

    /// Starts delivering logs emitted by `address`.
    ///
    /// When `block` is the block currently being executed, the logs `address`
    /// emitted in that block are returned, since they were not part of the
    /// block when it was delivered.
    fn watch(
        &mut self,
        address: Address,
        block: Option<BlockPtr>,
    ) -> BoxFuture<'_, Result<Vec<RawLog>>>;

    /// The hash of the canonical block at `number`, or `None` if the chain
    /// doesn't have that block yet.
    fn canonical(&mut self, number: u64) -> BoxFuture<'_, Result<Option<Digest>>>;

    /// Continues with the block after `head`, a block already indexed on the
    /// canonical chain.
    fn resume(&mut self, head: BlockPtr);
}
