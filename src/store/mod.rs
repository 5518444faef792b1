//! The versioned entity store.
//!
//! Committed state lives in a [`Database`]. Every entity version is tagged
//! with the block that produced it, which allows reading state as of any
//! indexed block and rolling back to a previous block after a reorg. Writes
//! made while executing a block are buffered in a [`Transaction`] and handed
//! to the database as a single [`Commit`].

mod memory;
mod sqlite;
mod transaction;

pub use self::{memory::Memory, sqlite::Sqlite, transaction::Transaction};
use crate::{
    sources::{Source, WatchedSource},
    trigger::BlockPtr,
    value::{Entity, EntityKey},
};
use anyhow::Result;

/// A change to a single entity, as of the block being committed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Change {
    /// The full new state of the entity.
    Set(EntityKey, Entity),
    Remove(EntityKey),
}

impl Change {
    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Set(key, _) | Self::Remove(key) => key,
        }
    }
}

/// Everything a block produced.
#[derive(Debug)]
pub struct Commit<'a> {
    pub block: BlockPtr,
    pub changes: &'a [Change],
    /// Dynamic sources created while executing the block.
    pub sources: &'a [WatchedSource],
    /// Content sources whose content was handled in the block.
    pub handled: &'a [Source],
}

/// Committed, versioned indexer state.
///
/// Note that the methods are blocking. If you call them from async code, make
/// sure you handle this correctly.
///
/// All mutating methods either succeed in full or error without having applied
/// any changes.
pub trait Database {
    /// The most recently committed block.
    fn head(&self) -> Result<Option<BlockPtr>>;

    /// Reads an entity as of `block`, or as of the head if `block` is `None`.
    /// Returns the latest version with an effective block at or before the
    /// requested one.
    fn get(&self, key: &EntityKey, block: Option<u64>) -> Result<Option<Entity>>;

    /// Reads all entities of a type as of `block` (or the head), ordered by
    /// id.
    fn find(&self, entity_type: &str, block: Option<u64>) -> Result<Vec<(String, Entity)>>;

    /// All persisted dynamic sources.
    fn sources(&self) -> Result<Vec<WatchedSource>>;

    /// Content sources whose content was handled as of the head. Content is
    /// handled at most once, in the first block that records it.
    fn handled(&self) -> Result<Vec<Source>>;

    /// Atomically applies all changes of a block. The block must be newer
    /// than the current head.
    ///
    /// Errors:
    ///
    /// - the block is not newer than the head
    /// - more than one change for the same entity key
    fn commit(&mut self, commit: &Commit) -> Result<()>;

    /// Discards all blocks, entity versions, sources and handled content
    /// newer than `block`.
    fn revert(&mut self, block: u64) -> Result<()>;
}

/// Checks the preconditions of [`Database::commit`] shared by all backends.
fn check_commit(head: Option<BlockPtr>, commit: &Commit) -> Result<()> {
    if let Some(head) = head {
        anyhow::ensure!(
            commit.block.number > head.number,
            "block {} is not newer than head {}",
            commit.block.number,
            head.number
        );
    }
    let mut keys = commit.changes.iter().map(Change::key).collect::<Vec<_>>();
    keys.sort();
    if let Some(pair) = keys.windows(2).find(|pair| pair[0] == pair[1]) {
        anyhow::bail!("multiple changes for {}", pair[0]);
    }
    anyhow::ensure!(
        commit.sources.iter().all(WatchedSource::is_dynamic),
        "only dynamic sources are persisted"
    );
    Ok(())
}
