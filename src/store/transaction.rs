use super::{Change, Database};
use crate::{
    sources::{Source, WatchedSource},
    trigger::BlockPtr,
    value::{Entity, EntityKey},
};
use anyhow::Result;
use std::collections::BTreeMap;

/// A pending operation on an entity.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Op {
    /// Merge fields into the current entity, creating it if it is absent.
    Update(Entity),
    /// Replace the entity regardless of its current state.
    Overwrite(Entity),
    Remove,
}

impl Op {
    fn apply_to(self, entity: Option<Entity>) -> Option<Entity> {
        match (self, entity) {
            (Op::Update(update), Some(mut entity)) => {
                entity.merge(update);
                Some(entity)
            }
            (Op::Update(entity), None) | (Op::Overwrite(entity), _) => Some(entity),
            (Op::Remove, _) => None,
        }
    }

    /// Folds `next` on top of this operation.
    fn accumulate(self, next: Op) -> Op {
        match (self, next) {
            (Op::Update(mut entity), Op::Update(update)) => {
                entity.merge(update);
                Op::Update(entity)
            }
            (Op::Overwrite(mut entity), Op::Update(update)) => {
                entity.merge(update);
                Op::Overwrite(entity)
            }
            (Op::Remove, Op::Update(entity)) => Op::Overwrite(entity),
            (_, next) => next,
        }
    }
}

/// The store view of a single executing block.
///
/// Writes are buffered and only become visible to other readers once the
/// block is committed; reads through the transaction observe its own pending
/// writes.
pub struct Transaction<'db> {
    database: &'db dyn Database,
    block: BlockPtr,
    updates: BTreeMap<EntityKey, Op>,
    sources: Vec<WatchedSource>,
}

impl<'db> Transaction<'db> {
    pub fn new(database: &'db dyn Database, block: BlockPtr) -> Self {
        Self {
            database,
            block,
            updates: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    pub fn block(&self) -> BlockPtr {
        self.block
    }

    /// Loads the current state of an entity, including pending writes.
    pub fn load(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let committed = self.database.get(key, None)?;
        Ok(match self.updates.get(key) {
            Some(op) => op.clone().apply_to(committed),
            None => committed,
        })
    }

    /// Upserts an entity, merging the specified fields into any existing
    /// ones.
    pub fn save(&mut self, key: EntityKey, entity: Entity) {
        self.push(key, Op::Update(entity));
    }

    /// Marks an entity as removed as of this block.
    pub fn remove(&mut self, key: EntityKey) {
        self.push(key, Op::Remove);
    }

    fn push(&mut self, key: EntityKey, op: Op) {
        let op = match self.updates.remove(&key) {
            Some(previous) => previous.accumulate(op),
            None => op,
        };
        self.updates.insert(key, op);
    }

    /// Records a dynamic source created in this block. Returns `false` if a
    /// source for the same address or hash was already created in this
    /// block.
    pub fn create_source(&mut self, source: WatchedSource) -> bool {
        if self.source(&source.source).is_some() {
            return false;
        }
        self.sources.push(source);
        true
    }

    pub fn source(&self, source: &Source) -> Option<&WatchedSource> {
        self.sources.iter().find(|watched| &watched.source == source)
    }

    pub fn source_mut(&mut self, source: &Source) -> Option<&mut WatchedSource> {
        self.sources
            .iter_mut()
            .find(|watched| &watched.source == source)
    }

    /// Resolves pending operations into the full entity changes to commit
    /// for this block. Removing an entity that never existed produces no
    /// change.
    pub fn into_parts(self) -> Result<(Vec<Change>, Vec<WatchedSource>)> {
        let mut changes = Vec::with_capacity(self.updates.len());
        for (key, op) in self.updates {
            let committed = self.database.get(&key, None)?;
            let existed = committed.is_some();
            match op.apply_to(committed) {
                Some(entity) => changes.push(Change::Set(key, entity)),
                None if existed => changes.push(Change::Remove(key)),
                None => {}
            }
        }
        Ok((changes, self.sources))
    }
}
