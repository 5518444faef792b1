use super::{Block, Feed, Update};
use crate::trigger::{BlockPtr, RawLog};
use anyhow::Result;
use futures::{future::BoxFuture, FutureExt};
use solabi::ethprim::{Address, Digest};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// A feed that replays a prepared sequence of updates. Blocks contain logs
/// from any address; only logs of watched addresses are delivered.
///
/// The canonical chain is the one described by the pushed updates: a pushed
/// block replaces any earlier block with its number, and a reorg drops every
/// block from the fork on.
#[derive(Debug, Default)]
pub struct Scripted {
    updates: VecDeque<Update>,
    watched: HashSet<Address>,
    current: Option<Block>,
    hashes: BTreeMap<u64, Digest>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_block(&mut self, block: Block) {
        self.hashes.insert(block.number, block.hash);
        self.updates.push_back(Update::Block(block));
    }

    pub fn push_reorg(&mut self, fork: u64, head: u64) {
        self.hashes.retain(|number, _| *number < fork);
        self.updates.push_back(Update::Reorg { fork, head });
    }

    /// Returns whether all updates were delivered.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    fn filter(&self, block: &Block) -> Block {
        Block {
            logs: block
                .logs
                .iter()
                .filter(|log| self.watched.contains(&log.address))
                .cloned()
                .collect(),
            ..block.clone()
        }
    }
}

impl Feed for Scripted {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Update>>> {
        async move {
            let update = match self.updates.pop_front() {
                Some(Update::Block(block)) => {
                    let filtered = self.filter(&block);
                    self.current = Some(block);
                    Update::Block(filtered)
                }
                Some(update) => update,
                None => return Ok(None),
            };
            Ok(Some(update))
        }
        .boxed()
    }

    fn watch(
        &mut self,
        address: Address,
        block: Option<BlockPtr>,
    ) -> BoxFuture<'_, Result<Vec<RawLog>>> {
        async move {
            self.watched.insert(address);
            let logs = match (block, &self.current) {
                (Some(ptr), Some(current)) if current.ptr() == ptr => current
                    .logs
                    .iter()
                    .filter(|log| log.address == address)
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            Ok(logs)
        }
        .boxed()
    }

    fn canonical(&mut self, number: u64) -> BoxFuture<'_, Result<Option<Digest>>> {
        let hash = self.hashes.get(&number).copied();
        async move { Ok(hash) }.boxed()
    }

    /// Updates are delivered as pushed, the indexed head doesn't skip any.
    fn resume(&mut self, _: BlockPtr) {}
}
