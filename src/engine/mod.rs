//! The execution engine. Blocks are processed one at a time in chain order;
//! every trigger of a block runs against a single store transaction that is
//! either committed in full or discarded.

mod content;
mod context;

pub use self::{
    content::{Directory, Disabled, Fixed, Resolver},
    context::Context,
};
use self::content::{Fetches, Resolved};
use crate::{
    feed::{Block, Feed, Update},
    query::Query,
    registry::{Handler, HandlerError, Registry, TemplateKind},
    sources::{Source, Sources, WatchedSource},
    store::{Change, Commit, Database, Transaction},
    trigger::{BlockPtr, Content, Log, Position, RawLog, Trigger},
};
use anyhow::{Context as _, Result};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::time;

/// Engine settings.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Treat missing references as unrecoverable errors.
    pub strict: bool,
    /// The number of times a failed block is retried before the index halts.
    pub retries: u32,
    pub retry_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            strict: false,
            retries: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// The health of the index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Healthy,
    /// A block kept failing. No further blocks are processed until a reorg
    /// rolls the index back past the failed block.
    Halted { block: u64, error: String },
}

/// The state of the most recent block the engine worked on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockState {
    Pending,
    Executing,
    Committed,
    RolledBack,
    Failed,
}

/// The outcome of processing a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Committed,
    /// The block was already indexed and was not executed again.
    Duplicate,
}

/// Everything a successfully executed block produced.
struct Execution {
    changes: Vec<Change>,
    sources: Vec<WatchedSource>,
    handled: Vec<Source>,
}

pub struct Engine<D> {
    database: D,
    registry: Registry,
    sources: Sources,
    fetches: Fetches,
    settings: Settings,
    status: Status,
    head: Option<BlockPtr>,
    state: Option<(u64, BlockState)>,
}

impl<D> Engine<D>
where
    D: Database,
{
    /// Creates a new engine, resuming from the state committed to `database`.
    pub fn new(
        database: D,
        registry: Registry,
        resolver: Arc<dyn Resolver>,
        settings: Settings,
    ) -> Result<Self> {
        let head = database.head()?;
        let sources = Sources::new(database.sources()?);
        for (address, watched) in sources.contracts() {
            if registry.kind(&watched.template).is_none() {
                tracing::warn!(
                    source = %Source::Contract(address), template = %watched.template,
                    "persisted source uses an unknown template"
                );
            }
        }
        tracing::info!(
            head = ?head.map(|head| head.number), sources = sources.len(),
            "loaded index state"
        );

        Ok(Self {
            database,
            registry,
            sources,
            fetches: Fetches::new(resolver),
            settings,
            status: Status::Healthy,
            head,
            state: None,
        })
    }

    /// Watches a statically configured contract.
    pub fn watch(&mut self, source: WatchedSource) -> Result<()> {
        anyhow::ensure!(
            !source.is_dynamic(),
            "{} was created dynamically",
            source.source
        );
        anyhow::ensure!(
            matches!(source.source, Source::Contract(_)),
            "static sources must be contracts"
        );
        anyhow::ensure!(
            self.registry.kind(&source.template) == Some(TemplateKind::Contract),
            "{} is not a contract template",
            source.template
        );
        self.sources.extend([source]);
        Ok(())
    }

    pub fn head(&self) -> Option<BlockPtr> {
        self.head
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The most recent block the engine worked on and its state.
    pub fn state(&self) -> Option<(u64, BlockState)> {
        self.state
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn database(&self) -> &D {
        &self.database
    }

    /// Read-only access to committed state.
    pub fn query(&self) -> Query<'_> {
        Query::new(&self.database, &self.status)
    }

    /// Prepares the engine for following `feed`. Committed blocks that are no
    /// longer canonical are rolled back before the feed resumes after the
    /// head.
    pub async fn start(&mut self, feed: &mut impl Feed) -> Result<()> {
        while let Some(head) = self.head {
            if feed.canonical(head.number).await? == Some(head.hash) {
                break;
            }
            tracing::warn!(block = %head.number, "indexed block is no longer canonical");
            self.rollback(head.number.checked_sub(1).context("reorg past genesis")?)?;
        }

        let addresses = self
            .sources
            .contracts()
            .map(|(address, _)| address)
            .collect::<Vec<_>>();
        for address in addresses {
            feed.watch(address, None).await?;
        }
        if let Some(head) = self.head {
            feed.resume(head);
        }
        self.refetch()
    }

    /// Runs the engine, continuously applying updates from the feed.
    pub async fn run(mut self, mut feed: impl Feed, poll_interval: Duration) -> Result<()> {
        self.start(&mut feed).await?;
        loop {
            match feed.next().await? {
                Some(update) => {
                    self.apply(&mut feed, update).await?;
                }
                None => time::sleep(poll_interval).await,
            }
        }
    }

    /// Applies a single update from the feed. Returns the outcome for blocks.
    pub async fn apply(
        &mut self,
        feed: &mut impl Feed,
        update: Update,
    ) -> Result<Option<Outcome>> {
        match update {
            Update::Block(block) => self.process_block(feed, block).await.map(Some),
            Update::Reorg { fork, head } => {
                tracing::info!(%fork, %head, "chain reorganization");
                let block = fork.checked_sub(1).context("reorg past genesis")?;
                self.rollback(block)?;
                Ok(None)
            }
        }
    }

    /// Executes and commits a block. Failed blocks are retried; once the
    /// retries are exhausted the index halts and the error is returned.
    pub async fn process_block(&mut self, feed: &mut impl Feed, block: Block) -> Result<Outcome> {
        if let Status::Halted { block: failed, error } = &self.status {
            anyhow::bail!("index halted at block {failed}: {error}");
        }
        if let Some(head) = self.head.filter(|head| block.number <= head.number) {
            tracing::warn!(block = %block.number, head = %head.number, "skipping duplicate block");
            return Ok(Outcome::Duplicate);
        }

        let ptr = block.ptr();
        self.state = Some((block.number, BlockState::Pending));
        let resolved = self.fetches.take_ready();
        let mut attempt = 0;
        loop {
            self.state = Some((block.number, BlockState::Executing));
            let execution = self.execute(feed, &block, &resolved).await;
            let err = match execution.and_then(|execution| self.commit(ptr, execution)) {
                Ok(()) => {
                    self.state = Some((block.number, BlockState::Committed));
                    return Ok(Outcome::Committed);
                }
                Err(err) => err,
            };

            self.state = Some((block.number, BlockState::Failed));
            attempt += 1;
            if attempt > self.settings.retries {
                tracing::error!(block = %block.number, ?err, "halting index");
                self.status = Status::Halted {
                    block: block.number,
                    error: format!("{err:#}"),
                };
                self.fetches.restore(resolved);
                return Err(err.context(format!("index halted at block {}", block.number)));
            }
            tracing::warn!(block = %block.number, %attempt, ?err, "block failed, retrying");
            time::sleep(self.settings.retry_interval).await;
        }
    }

    /// Rolls back all state newer than `block`. This clears a halt caused by
    /// any of the discarded blocks.
    pub fn rollback(&mut self, block: u64) -> Result<()> {
        self.database.revert(block)?;
        let reverted = self.sources.revert(block);
        self.head = self.database.head()?;
        tracing::debug!(%block, sources = %reverted, "rolled back");

        if matches!(self.status, Status::Halted { block: failed, .. } if failed > block) {
            tracing::info!("resuming halted index");
            self.status = Status::Healthy;
        }
        self.state = Some((block + 1, BlockState::RolledBack));
        self.refetch()
    }

    /// Fetches the content of every watched content source that wasn't
    /// handled as of the head.
    fn refetch(&mut self) -> Result<()> {
        let handled = self.database.handled()?.into_iter().collect::<HashSet<_>>();
        for hash in self.sources.contents() {
            if !handled.contains(&Source::Content(hash.to_owned())) {
                self.fetches.spawn(hash.to_owned());
            }
        }
        Ok(())
    }

    /// Waits for in-flight content fetches, so that their results are
    /// processed with the next block.
    pub async fn settle(&mut self) {
        self.fetches.settle().await;
    }

    async fn execute(
        &self,
        feed: &mut impl Feed,
        block: &Block,
        resolved: &[Resolved],
    ) -> Result<Execution> {
        let ptr = block.ptr();
        let mut transaction = Transaction::new(&self.database, ptr);

        let mut queue = BTreeMap::<Position, RawLog>::new();
        for log in &block.logs {
            if log.block_number != block.number {
                tracing::warn!(block = %block.number, log = %log.position(), "log from another block");
                continue;
            }
            if queue.insert(log.position(), log.clone()).is_some() {
                tracing::warn!(position = %log.position(), "dropping duplicate log");
            }
        }

        while let Some((position, log)) = queue.pop_first() {
            for source in self.handle_log(&mut transaction, block, &log)? {
                let Source::Contract(address) = source else {
                    continue;
                };
                // Logs the new contract emitted earlier in the block were
                // never observed, later ones join the queue.
                for log in feed.watch(address, Some(ptr)).await? {
                    if log.block_number == block.number && log.position() > position {
                        queue.entry(log.position()).or_insert(log);
                    }
                }
            }
        }

        let mut handled = Vec::new();
        for (n, resolved) in resolved.iter().enumerate() {
            let source = Source::Content(resolved.hash.clone());
            if resolved.result.is_ok() && self.sources.contains(&source) {
                handled.push(source);
            }
            let position = Position::content(block.number, n as u64);
            for source in self.handle_content(&mut transaction, ptr, position, resolved)? {
                if let Source::Contract(address) = source {
                    feed.watch(address, None).await?;
                }
            }
        }

        let (changes, sources) = transaction.into_parts()?;
        Ok(Execution {
            changes,
            sources,
            handled,
        })
    }

    fn handle_log(
        &self,
        transaction: &mut Transaction,
        block: &Block,
        log: &RawLog,
    ) -> Result<Vec<Source>> {
        let source = Source::Contract(log.address);
        let Some(watched) = self
            .sources
            .get(&source)
            .or_else(|| transaction.source(&source))
            .cloned()
        else {
            return Ok(Vec::new());
        };
        let position = log.position();
        if !watched.origin.observes(position) {
            tracing::trace!(%source, %position, "log before source was created");
            return Ok(Vec::new());
        }
        let Some(binding) = self.registry.resolve(&watched.template, log) else {
            return Ok(Vec::new());
        };

        let event = &binding.descriptor().name;
        let params = match binding.decode(log) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(%event, %position, ?err, "skipping undecodable log");
                return Ok(Vec::new());
            }
        };
        tracing::trace!(%event, %position, "handling log");

        let trigger = Trigger::Log(Log {
            block: block.ptr(),
            timestamp: block.timestamp,
            transaction_hash: log.transaction_hash,
            position,
            address: log.address,
            event: event.clone(),
            params,
        });
        self.run_handler(binding.handler(), &trigger, transaction, &watched)
    }

    fn handle_content(
        &self,
        transaction: &mut Transaction,
        block: BlockPtr,
        position: Position,
        resolved: &Resolved,
    ) -> Result<Vec<Source>> {
        let source = Source::Content(resolved.hash.clone());
        let Some(watched) = self.sources.get(&source) else {
            tracing::debug!(%source, "dropping content of a source that is no longer watched");
            return Ok(Vec::new());
        };
        let payload = match &resolved.result {
            Ok(payload) => payload.clone(),
            Err(err) => {
                tracing::warn!(%source, ?err, "dropping failed content fetch");
                return Ok(Vec::new());
            }
        };
        let Some(handler) = self.registry.resolve_content(&watched.template) else {
            return Ok(Vec::new());
        };

        let trigger = Trigger::Content(Content {
            block,
            position,
            hash: resolved.hash.clone(),
            payload,
        });
        self.run_handler(handler, &trigger, transaction, watched)
    }

    /// Invokes a handler and returns the sources it created.
    fn run_handler(
        &self,
        handler: &dyn Handler,
        trigger: &Trigger,
        transaction: &mut Transaction,
        watched: &WatchedSource,
    ) -> Result<Vec<Source>> {
        let position = trigger.position();
        let mut ctx = Context::new(transaction, &self.sources, &self.registry, watched, position);
        let result = handler.handle(trigger, &mut ctx);
        let created = ctx.into_created();

        match result {
            Ok(()) => {}
            Err(HandlerError::MissingReference { entity_type, id }) if !self.settings.strict => {
                tracing::warn!(
                    %position, %entity_type, %id,
                    "missing reference, skipping rest of handler"
                );
            }
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("handler for {} failed at {position}", watched.source)));
            }
        }
        Ok(created)
    }

    fn commit(&mut self, block: BlockPtr, execution: Execution) -> Result<()> {
        self.database.commit(&Commit {
            block,
            changes: &execution.changes,
            sources: &execution.sources,
            handled: &execution.handled,
        })?;
        tracing::debug!(
            block = %block.number, changes = %execution.changes.len(),
            sources = %execution.sources.len(), "committed block"
        );

        for watched in &execution.sources {
            if let Source::Content(hash) = &watched.source {
                self.fetches.spawn(hash.clone());
            }
        }
        self.sources.extend(execution.sources);
        self.head = Some(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
