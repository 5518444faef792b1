//! In-memory arena store: an append-only log of entity versions with a
//! per-key index of log positions.

use super::{check_commit, Change, Commit, Database};
use crate::{
    sources::{Source, WatchedSource},
    trigger::BlockPtr,
    value::{Entity, EntityKey},
};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct Memory {
    /// Invariant: ordered by block, since blocks are committed in order and
    /// reverts only ever truncate the tail.
    log: Vec<Version>,
    /// Positions in `log` of every version of a key, in ascending order.
    /// The last entry is the latest version.
    index: HashMap<EntityKey, Vec<usize>>,
    /// Ids of every type that has at least one version.
    ids: BTreeMap<String, BTreeSet<String>>,
    blocks: Vec<BlockPtr>,
    sources: Vec<(u64, WatchedSource)>,
    handled: Vec<(u64, Source)>,
}

#[derive(Debug)]
struct Version {
    key: EntityKey,
    block: u64,
    /// `None` marks the entity as removed as of `block`.
    entity: Option<Entity>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn version(&self, key: &EntityKey, block: Option<u64>) -> Option<&Version> {
        let positions = self.index.get(key)?;
        let position = match block {
            None => *positions.last()?,
            Some(block) => {
                let count = positions.partition_point(|&i| self.log[i].block <= block);
                *positions[..count].last()?
            }
        };
        Some(&self.log[position])
    }
}

impl Database for Memory {
    fn head(&self) -> Result<Option<BlockPtr>> {
        Ok(self.blocks.last().copied())
    }

    fn get(&self, key: &EntityKey, block: Option<u64>) -> Result<Option<Entity>> {
        Ok(self
            .version(key, block)
            .and_then(|version| version.entity.clone()))
    }

    fn find(&self, entity_type: &str, block: Option<u64>) -> Result<Vec<(String, Entity)>> {
        let Some(ids) = self.ids.get(entity_type) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                let key = EntityKey::new(entity_type, id.as_str());
                let entity = self.version(&key, block)?.entity.clone()?;
                Some((id.clone(), entity))
            })
            .collect())
    }

    fn sources(&self) -> Result<Vec<WatchedSource>> {
        Ok(self
            .sources
            .iter()
            .map(|(_, source)| source.clone())
            .collect())
    }

    fn handled(&self) -> Result<Vec<Source>> {
        Ok(self
            .handled
            .iter()
            .map(|(_, source)| source.clone())
            .collect())
    }

    fn commit(&mut self, commit: &Commit) -> Result<()> {
        check_commit(self.head()?, commit)?;

        let block = commit.block.number;
        for change in commit.changes {
            let (key, entity) = match change {
                Change::Set(key, entity) => (key, Some(entity.clone())),
                Change::Remove(key) => (key, None),
            };
            self.index
                .entry(key.clone())
                .or_default()
                .push(self.log.len());
            self.ids
                .entry(key.entity_type.clone())
                .or_default()
                .insert(key.id.clone());
            self.log.push(Version {
                key: key.clone(),
                block,
                entity,
            });
        }
        self.sources.extend(
            commit
                .sources
                .iter()
                .map(|source| (block, source.clone())),
        );
        for source in commit.handled {
            if !self.handled.iter().any(|(_, handled)| handled == source) {
                self.handled.push((block, source.clone()));
            }
        }
        self.blocks.push(commit.block);
        Ok(())
    }

    fn revert(&mut self, block: u64) -> Result<()> {
        while self.log.last().is_some_and(|version| version.block > block) {
            let Some(version) = self.log.pop() else {
                break;
            };
            let Some(positions) = self.index.get_mut(&version.key) else {
                continue;
            };
            positions.pop();
            if positions.is_empty() {
                self.index.remove(&version.key);
                if let Some(ids) = self.ids.get_mut(&version.key.entity_type) {
                    ids.remove(&version.key.id);
                }
            }
        }
        self.sources.retain(|(created, _)| *created <= block);
        self.handled.retain(|(handled, _)| *handled <= block);
        self.blocks.retain(|ptr| ptr.number <= block);
        Ok(())
    }
}
