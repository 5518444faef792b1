use crate::{
    registry::{HandlerError, Registry, TemplateKind},
    sources::{Origin, Source, Sources, WatchedSource},
    store::Transaction,
    trigger::{BlockPtr, Position},
    value::{Entity, EntityKey, Value},
};
use anyhow::anyhow;
use std::collections::BTreeMap;

/// Everything a handler can interact with while it executes: the block's
/// store transaction and the watched sources.
pub struct Context<'a, 'db> {
    transaction: &'a mut Transaction<'db>,
    sources: &'a Sources,
    registry: &'a Registry,
    source: &'a WatchedSource,
    position: Position,
    created: Vec<Source>,
}

impl<'a, 'db> Context<'a, 'db> {
    pub(super) fn new(
        transaction: &'a mut Transaction<'db>,
        sources: &'a Sources,
        registry: &'a Registry,
        source: &'a WatchedSource,
        position: Position,
    ) -> Self {
        Self {
            transaction,
            sources,
            registry,
            source,
            position,
            created: Vec::new(),
        }
    }

    /// Sources created by the handler.
    pub(super) fn into_created(self) -> Vec<Source> {
        self.created
    }

    pub fn block(&self) -> BlockPtr {
        self.transaction.block()
    }

    /// The position of the trigger being handled.
    pub fn position(&self) -> Position {
        self.position
    }

    /// The source that the trigger being handled belongs to.
    pub fn source(&self) -> &WatchedSource {
        self.source
    }

    /// Reads a context value of the source the trigger belongs to.
    pub fn context(&self, key: &str) -> Option<&Value> {
        self.source.context.get(key)
    }

    pub fn load(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, HandlerError> {
        Ok(self.transaction.load(&EntityKey::new(entity_type, id))?)
    }

    /// Loads an entity that is expected to exist.
    pub fn require(&self, entity_type: &str, id: &str) -> Result<Entity, HandlerError> {
        self.load(entity_type, id)?
            .ok_or_else(|| HandlerError::missing(entity_type, id))
    }

    pub fn save(&mut self, entity_type: &str, id: &str, entity: Entity) {
        self.transaction
            .save(EntityKey::new(entity_type, id), entity);
    }

    pub fn remove(&mut self, entity_type: &str, id: &str) {
        self.transaction.remove(EntityKey::new(entity_type, id));
    }

    /// Starts watching a new source with the handlers of `template`. The
    /// source observes triggers after the current one, including the rest of
    /// the current block. Creating a source that is already watched does
    /// nothing.
    pub fn create_instance(
        &mut self,
        template: &str,
        source: Source,
        context: BTreeMap<String, Value>,
    ) -> Result<(), HandlerError> {
        let kind = self
            .registry
            .kind(template)
            .ok_or_else(|| anyhow!("unknown template {template}"))?;
        let expected = match source {
            Source::Contract(_) => TemplateKind::Contract,
            Source::Content(_) => TemplateKind::Content,
        };
        if kind != expected {
            return Err(anyhow!("template {template} can't watch {source}").into());
        }

        if self.sources.contains(&source) {
            tracing::debug!(%source, "source already watched");
            return Ok(());
        }
        let created = self.transaction.create_source(WatchedSource {
            source: source.clone(),
            template: template.to_owned(),
            context,
            origin: Origin::dynamic(self.position),
        });
        if created {
            tracing::debug!(%source, %template, "created source");
            self.created.push(source);
        }
        Ok(())
    }

    /// Attaches a context value to a source created in the current block.
    /// Context is immutable once the block that created the source commits.
    pub fn attach_context(
        &mut self,
        source: &Source,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), HandlerError> {
        let watched = self
            .transaction
            .source_mut(source)
            .ok_or_else(|| anyhow!("context of {source} is immutable"))?;
        watched.context.insert(key.to_owned(), value.into());
        Ok(())
    }
}
