use super::*;
use crate::{
    feed::Scripted,
    query::QueryError,
    registry::HandlerError,
    sources::Origin,
    store::{Memory, Sqlite},
    value::{Entity, EntityKey, Value},
};
use num_bigint::BigInt;
use solabi::{
    abi::EventDescriptor,
    ethprim::{Address, Digest},
};
use url::Url;

const FACTORY: Address = Address([0xfa; 20]);
const MANAGER: Address = Address([0x01; 20]);
const OTHER_MANAGER: Address = Address([0x02; 20]);

const MANAGER_CREATED: &str = "event TaskManagerCreated(address indexed taskManager)";
const TASK_CREATED: &str = "event TaskCreated(uint256 indexed id, uint256 indexed payout)";
const TASK_UPDATED: &str = "event TaskUpdated(uint256 indexed id, uint256 indexed payout)";
const TASK_COMPLETED: &str = "event TaskCompleted(uint256 indexed id)";
const TASK_DELETED: &str = "event TaskDeleted(uint256 indexed id)";

fn manager_created(trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
    let log = trigger.as_log().unwrap();
    let address = log.param("taskManager").and_then(Value::as_address).unwrap();
    let source = Source::Contract(address);

    ctx.create_instance("TaskManager", source.clone(), BTreeMap::new())?;
    ctx.attach_context(&source, "factory", log.address)?;
    ctx.save(
        "TaskManager",
        &source.to_string(),
        Entity::new()
            .with("activeTasks", 0_u64)
            .with("completedTasks", 0_u64),
    );
    Ok(())
}

fn manager_id(ctx: &Context) -> String {
    ctx.source().source.to_string()
}

fn task_id(log: &Log, ctx: &Context) -> String {
    format!("{}-{}", log.param("id").unwrap(), manager_id(ctx))
}

fn task_created(trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
    let log = trigger.as_log().unwrap();
    let manager = manager_id(ctx);
    let active = ctx
        .require("TaskManager", &manager)?
        .int("activeTasks")
        .cloned()
        .unwrap_or_default();
    ctx.save(
        "TaskManager",
        &manager,
        Entity::new().with("activeTasks", active + 1_u32),
    );

    let id = task_id(log, ctx);
    let hash = format!("QmTask{}", log.param("id").unwrap());
    ctx.save(
        "Task",
        &id,
        Entity::new()
            .with("payout", log.param("payout").unwrap().clone())
            .with("completed", false)
            .with("manager", Value::Reference(manager)),
    );
    ctx.create_instance(
        "TaskMetadata",
        Source::Content(hash),
        BTreeMap::from([("task".to_owned(), Value::from(id))]),
    )?;
    Ok(())
}

fn task_updated(trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
    let log = trigger.as_log().unwrap();
    let id = task_id(log, ctx);
    ctx.require("Task", &id)?;
    ctx.save(
        "Task",
        &id,
        Entity::new().with("payout", log.param("payout").unwrap().clone()),
    );
    Ok(())
}

fn task_completed(trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
    let log = trigger.as_log().unwrap();
    let id = task_id(log, ctx);
    let manager_id = manager_id(ctx);
    ctx.require("Task", &id)?;
    let manager = ctx.require("TaskManager", &manager_id)?;

    let active = manager.int("activeTasks").cloned().unwrap_or_default() - 1_u32;
    if active < BigInt::from(0) {
        return Err(HandlerError::invariant("negative active task count"));
    }
    let completed = manager.int("completedTasks").cloned().unwrap_or_default() + 1_u32;
    ctx.save(
        "TaskManager",
        &manager_id,
        Entity::new()
            .with("activeTasks", active)
            .with("completedTasks", completed),
    );
    ctx.save("Task", &id, Entity::new().with("completed", true));
    Ok(())
}

fn task_deleted(trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
    let log = trigger.as_log().unwrap();
    let id = task_id(log, ctx);
    ctx.remove("Task", &id);
    Ok(())
}

fn task_metadata(trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
    let content = trigger.as_content().unwrap();
    let title = serde_json::from_slice::<serde_json::Value>(&content.payload)
        .ok()
        .and_then(|json| Some(json.get("title")?.as_str()?.to_owned()))
        .unwrap_or_default();
    let task = ctx.context("task").cloned().unwrap_or(Value::Null);
    ctx.save(
        "TaskMetadata",
        &content.hash,
        Entity::new().with("title", title).with("task", task),
    );
    Ok(())
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .template("TaskManagerFactory", TemplateKind::Contract)
        .unwrap();
    registry
        .template("TaskManager", TemplateKind::Contract)
        .unwrap();
    registry
        .template("TaskMetadata", TemplateKind::Content)
        .unwrap();

    registry
        .register("TaskManagerFactory", MANAGER_CREATED, manager_created)
        .unwrap();
    registry
        .register("TaskManager", TASK_CREATED, task_created)
        .unwrap();
    registry
        .register("TaskManager", TASK_UPDATED, task_updated)
        .unwrap();
    registry
        .register("TaskManager", TASK_COMPLETED, task_completed)
        .unwrap();
    registry
        .register("TaskManager", TASK_DELETED, task_deleted)
        .unwrap();
    registry
        .register_content("TaskMetadata", task_metadata)
        .unwrap();
    registry
}

fn settings() -> Settings {
    Settings {
        strict: false,
        retries: 1,
        retry_interval: Duration::ZERO,
    }
}

fn static_source(address: Address, template: &str) -> WatchedSource {
    WatchedSource {
        source: Source::Contract(address),
        template: template.to_owned(),
        context: BTreeMap::new(),
        origin: Origin::Static { start: 0 },
    }
}

async fn setup<D: Database>(
    database: D,
    resolver: Fixed,
    settings: Settings,
) -> (Engine<D>, Scripted) {
    let mut engine = Engine::new(database, registry(), Arc::new(resolver), settings).unwrap();
    engine
        .watch(static_source(FACTORY, "TaskManagerFactory"))
        .unwrap();
    let mut feed = Scripted::new();
    engine.start(&mut feed).await.unwrap();
    (engine, feed)
}

/// Applies all queued updates, stopping at the first error.
async fn drain<D: Database>(
    engine: &mut Engine<D>,
    feed: &mut Scripted,
) -> Result<Vec<Option<Outcome>>> {
    let mut outcomes = Vec::new();
    while let Some(update) = feed.next().await? {
        outcomes.push(engine.apply(feed, update).await?);
    }
    Ok(outcomes)
}

/// Applies all queued updates, waiting for content fetches before each one so
/// that content is always handled in the block right after its fetch started.
async fn drain_settled<D: Database>(engine: &mut Engine<D>, feed: &mut Scripted) {
    while let Some(update) = feed.next().await.unwrap() {
        engine.settle().await;
        engine.apply(feed, update).await.unwrap();
    }
}

fn database_url(name: &str) -> Url {
    let path = std::env::temp_dir().join(format!("strata-{name}-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    Url::parse(&format!("sqlite:///{}", path.display())).unwrap()
}

fn selector(declaration: &str) -> Digest {
    Digest(
        EventDescriptor::parse_declaration(declaration)
            .unwrap()
            .selector()
            .unwrap(),
    )
}

fn uint(value: u64) -> Digest {
    let mut word = [0; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    Digest(word)
}

fn address(value: Address) -> Digest {
    let mut word = [0; 32];
    word[12..].copy_from_slice(&value.0);
    Digest(word)
}

fn log(address: Address, index: u64, declaration: &str, params: &[Digest]) -> RawLog {
    let mut topics = vec![selector(declaration)];
    topics.extend_from_slice(params);
    RawLog {
        address,
        topics,
        transaction_hash: Digest([index as u8; 32]),
        transaction_index: index,
        log_index: index,
        ..Default::default()
    }
}

fn block(number: u64, logs: Vec<RawLog>) -> Block {
    Block {
        number,
        hash: Digest([number as u8; 32]),
        parent_hash: Digest([number.wrapping_sub(1) as u8; 32]),
        timestamp: 1_700_000_000 + number * 12,
        logs: logs
            .into_iter()
            .map(|log| RawLog {
                block_number: number,
                ..log
            })
            .collect(),
    }
}

fn manager(manager: Address, index: u64) -> RawLog {
    log(FACTORY, index, MANAGER_CREATED, &[address(manager)])
}

fn created(manager: Address, index: u64, id: u64, payout: u64) -> RawLog {
    log(manager, index, TASK_CREATED, &[uint(id), uint(payout)])
}

fn updated(manager: Address, index: u64, id: u64, payout: u64) -> RawLog {
    log(manager, index, TASK_UPDATED, &[uint(id), uint(payout)])
}

fn completed(manager: Address, index: u64, id: u64) -> RawLog {
    log(manager, index, TASK_COMPLETED, &[uint(id)])
}

fn deleted(manager: Address, index: u64, id: u64) -> RawLog {
    log(manager, index, TASK_DELETED, &[uint(id)])
}

fn task_key(manager: Address, id: u64) -> String {
    format!("{id}-{}", Source::Contract(manager))
}

fn get<D: Database>(engine: &Engine<D>, entity_type: &str, id: &str) -> Option<Entity> {
    engine.query().get_entity(entity_type, id, None).unwrap()
}

fn int(entity: &Entity, field: &str) -> u64 {
    entity.int(field).unwrap().try_into().unwrap()
}

#[tokio::test]
async fn instances_observe_logs_after_their_creation() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    feed.push_block(block(
        1,
        vec![
            created(MANAGER, 0, 7, 70),
            manager(MANAGER, 1),
            created(MANAGER, 2, 1, 10),
            created(OTHER_MANAGER, 3, 2, 20),
            // Not registered for the factory template.
            log(FACTORY, 4, TASK_DELETED, &[uint(1)]),
        ],
    ));
    feed.push_block(block(2, vec![created(MANAGER, 0, 3, 30)]));

    assert_eq!(
        drain(&mut engine, &mut feed).await.unwrap(),
        [Some(Outcome::Committed), Some(Outcome::Committed)]
    );

    assert!(get(&engine, "Task", &task_key(MANAGER, 7)).is_none());
    assert!(get(&engine, "Task", &task_key(OTHER_MANAGER, 2)).is_none());
    assert_eq!(
        get(&engine, "Task", &task_key(MANAGER, 1)),
        Some(
            Entity::new()
                .with("payout", 10_u64)
                .with("completed", false)
                .with(
                    "manager",
                    Value::Reference(Source::Contract(MANAGER).to_string())
                )
        )
    );
    assert!(get(&engine, "Task", &task_key(MANAGER, 3)).is_some());

    let manager_entity = get(&engine, "TaskManager", &Source::Contract(MANAGER).to_string()).unwrap();
    assert_eq!(int(&manager_entity, "activeTasks"), 2);

    let watched = engine.sources().get(&Source::Contract(MANAGER)).unwrap();
    assert_eq!(watched.template, "TaskManager");
    assert_eq!(
        watched.context.get("factory"),
        Some(&Value::Address(FACTORY))
    );
    assert_eq!(
        watched.origin,
        Origin::Dynamic {
            block: 1,
            transaction_index: 1,
            log_index: 1
        }
    );
    assert_eq!(engine.state(), Some((2, BlockState::Committed)));
}

#[tokio::test]
async fn rejects_duplicate_blocks() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    let first = block(1, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]);
    feed.push_block(first.clone());
    feed.push_block(first);
    feed.push_block(block(2, vec![created(MANAGER, 0, 1, 10)]));

    assert_eq!(
        drain(&mut engine, &mut feed).await.unwrap(),
        [
            Some(Outcome::Committed),
            Some(Outcome::Duplicate),
            Some(Outcome::Committed)
        ]
    );

    // Re-creating the same task still counts, but the duplicate block did
    // not.
    let manager_entity = get(&engine, "TaskManager", &Source::Contract(MANAGER).to_string()).unwrap();
    assert_eq!(int(&manager_entity, "activeTasks"), 2);
}

#[tokio::test]
async fn drops_duplicate_log_positions() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    feed.push_block(block(
        1,
        vec![
            manager(MANAGER, 0),
            created(MANAGER, 1, 1, 10),
            created(MANAGER, 1, 1, 10),
        ],
    ));
    drain(&mut engine, &mut feed).await.unwrap();

    let manager_entity = get(&engine, "TaskManager", &Source::Contract(MANAGER).to_string()).unwrap();
    assert_eq!(int(&manager_entity, "activeTasks"), 1);
}

#[tokio::test]
async fn create_update_delete_in_one_block() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    feed.push_block(block(
        1,
        vec![
            manager(MANAGER, 0),
            created(MANAGER, 1, 1, 0),
            updated(MANAGER, 2, 1, 50),
            deleted(MANAGER, 3, 1),
        ],
    ));
    drain(&mut engine, &mut feed).await.unwrap();

    assert_eq!(get(&engine, "Task", &task_key(MANAGER, 1)), None);
    assert_eq!(
        engine
            .query()
            .get_entity("Task", &task_key(MANAGER, 1), Some(1))
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn failed_blocks_are_atomic_and_halt() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    feed.push_block(block(1, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]));
    feed.push_block(block(
        2,
        vec![
            updated(MANAGER, 0, 1, 99),
            completed(MANAGER, 1, 1),
            completed(MANAGER, 2, 1),
        ],
    ));
    feed.push_block(block(3, vec![]));

    assert!(drain(&mut engine, &mut feed).await.is_err());
    assert_eq!(engine.head().map(|head| head.number), Some(1));
    assert_eq!(engine.state(), Some((2, BlockState::Failed)));
    assert!(matches!(
        engine.status(),
        Status::Halted { block: 2, .. }
    ));

    // Nothing of the failed block is visible.
    let task = engine
        .database()
        .get(&EntityKey::new("Task", task_key(MANAGER, 1)), None)
        .unwrap()
        .unwrap();
    assert_eq!(int(&task, "payout"), 10);
    assert_eq!(task.bool("completed"), Some(false));
    assert!(matches!(
        engine.query().get_entity("Task", &task_key(MANAGER, 1), None),
        Err(QueryError::Halted { block: 2, .. })
    ));

    // Halted engines refuse new blocks.
    assert!(drain(&mut engine, &mut feed).await.is_err());
    assert_eq!(engine.head().map(|head| head.number), Some(1));

    // A reorg past the failed block resumes indexing.
    feed.push_reorg(2, 2);
    feed.push_block(block(2, vec![updated(MANAGER, 0, 1, 99)]));
    drain(&mut engine, &mut feed).await.unwrap();
    assert_eq!(engine.status(), &Status::Healthy);
    let task = get(&engine, "Task", &task_key(MANAGER, 1)).unwrap();
    assert_eq!(int(&task, "payout"), 99);
}

#[tokio::test]
async fn skips_missing_references() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    engine
        .watch(static_source(OTHER_MANAGER, "TaskManager"))
        .unwrap();
    engine.start(&mut feed).await.unwrap();
    feed.push_block(block(
        1,
        vec![
            // There is no task manager entity for this address.
            created(OTHER_MANAGER, 0, 1, 10),
            manager(MANAGER, 1),
            created(MANAGER, 2, 1, 10),
        ],
    ));

    assert_eq!(
        drain(&mut engine, &mut feed).await.unwrap(),
        [Some(Outcome::Committed)]
    );
    assert!(get(&engine, "Task", &task_key(OTHER_MANAGER, 1)).is_none());
    assert!(get(&engine, "Task", &task_key(MANAGER, 1)).is_some());
}

#[tokio::test]
async fn missing_references_fail_in_strict_mode() {
    let (mut engine, mut feed) = setup(
        Memory::new(),
        Fixed::new(),
        Settings {
            strict: true,
            retries: 0,
            ..settings()
        },
    )
    .await;
    engine
        .watch(static_source(OTHER_MANAGER, "TaskManager"))
        .unwrap();
    engine.start(&mut feed).await.unwrap();
    feed.push_block(block(
        1,
        vec![manager(MANAGER, 0), created(OTHER_MANAGER, 1, 1, 10)],
    ));

    assert!(drain(&mut engine, &mut feed).await.is_err());
    assert_eq!(engine.head(), None);
    assert!(matches!(
        engine.status(),
        Status::Halted { block: 1, .. }
    ));
    assert!(engine.sources().get(&Source::Contract(MANAGER)).is_none());
}

#[tokio::test]
async fn rolls_back_reorged_blocks() {
    let (mut engine, mut feed) = setup(Memory::new(), Fixed::new(), settings()).await;
    feed.push_block(block(99, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]));
    feed.push_block(block(100, vec![]));
    feed.push_block(block(101, vec![]));
    feed.push_block(block(102, vec![updated(MANAGER, 0, 1, 20)]));
    feed.push_block(block(103, vec![manager(OTHER_MANAGER, 0)]));
    feed.push_block(block(104, vec![]));
    feed.push_block(block(105, vec![]));
    drain(&mut engine, &mut feed).await.unwrap();

    let task = get(&engine, "Task", &task_key(MANAGER, 1)).unwrap();
    assert_eq!(int(&task, "payout"), 20);
    assert!(engine.sources().contains(&Source::Contract(OTHER_MANAGER)));

    feed.push_reorg(100, 105);
    assert_eq!(drain(&mut engine, &mut feed).await.unwrap(), [None]);

    assert_eq!(engine.head().map(|head| head.number), Some(99));
    assert_eq!(engine.state(), Some((100, BlockState::RolledBack)));
    let task = get(&engine, "Task", &task_key(MANAGER, 1)).unwrap();
    assert_eq!(int(&task, "payout"), 10);
    assert!(!engine.sources().contains(&Source::Contract(OTHER_MANAGER)));
    assert!(get(&engine, "TaskManager", &Source::Contract(OTHER_MANAGER).to_string()).is_none());
    assert!(matches!(
        engine
            .query()
            .get_entity("Task", &task_key(MANAGER, 1), Some(102)),
        Err(QueryError::BlockNotIndexed { requested: 102, .. })
    ));

    // The new branch is processed from the fork block.
    let mut fork = block(100, vec![updated(MANAGER, 0, 1, 30)]);
    fork.hash = Digest([0xee; 32]);
    feed.push_block(fork);
    assert_eq!(
        drain(&mut engine, &mut feed).await.unwrap(),
        [Some(Outcome::Committed)]
    );
    let task = get(&engine, "Task", &task_key(MANAGER, 1)).unwrap();
    assert_eq!(int(&task, "payout"), 30);
}

async fn replays_deterministically<D: Database>(database: D) {
    let blocks = [
        block(1, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]),
        block(2, vec![created(MANAGER, 0, 2, 20), manager(OTHER_MANAGER, 1)]),
        block(
            3,
            vec![
                completed(MANAGER, 0, 1),
                created(OTHER_MANAGER, 1, 1, 5),
                updated(MANAGER, 2, 2, 25),
            ],
        ),
        block(4, vec![deleted(MANAGER, 0, 2)]),
    ];

    let resolver = Fixed::new();
    resolver.insert("QmTask1", br#"{"title":"Write docs"}"#.to_vec());
    resolver.insert("QmTask2", br#"{"title":"Review"}"#.to_vec());
    let (mut engine, mut feed) = setup(database, resolver, settings()).await;
    for block in &blocks {
        feed.push_block(block.clone());
    }
    drain_settled(&mut engine, &mut feed).await;

    let snapshot = |engine: &Engine<D>| {
        ["Task", "TaskManager", "TaskMetadata"]
            .into_iter()
            .map(|entity_type| engine.database().find(entity_type, None).unwrap())
            .collect::<Vec<_>>()
    };
    let before = snapshot(&engine);

    feed.push_reorg(2, 4);
    for block in &blocks[1..] {
        feed.push_block(block.clone());
    }
    drain_settled(&mut engine, &mut feed).await;

    assert_eq!(snapshot(&engine), before);
    assert_eq!(before[2].len(), 2);
    assert_eq!(engine.head().map(|head| head.number), Some(4));
}

#[tokio::test]
async fn replays_deterministically_in_memory() {
    replays_deterministically(Memory::new()).await;
}

#[tokio::test]
async fn replays_deterministically_in_sqlite() {
    replays_deterministically(Sqlite::new_for_test()).await;
}

#[tokio::test]
async fn executes_resolved_content_in_next_block() {
    let resolver = Fixed::new();
    resolver.insert("QmTask1", br#"{"title":"Write docs"}"#.to_vec());
    resolver.insert("QmTask2", b"not json".to_vec());
    let (mut engine, mut feed) = setup(Memory::new(), resolver, settings()).await;

    feed.push_block(block(
        1,
        vec![
            manager(MANAGER, 0),
            created(MANAGER, 1, 1, 10),
            created(MANAGER, 2, 2, 20),
            created(MANAGER, 3, 3, 30),
        ],
    ));
    drain(&mut engine, &mut feed).await.unwrap();
    assert!(get(&engine, "TaskMetadata", "QmTask1").is_none());
    assert!(engine
        .sources()
        .contains(&Source::Content("QmTask1".to_owned())));

    engine.settle().await;
    feed.push_block(block(2, vec![]));
    drain(&mut engine, &mut feed).await.unwrap();

    assert_eq!(
        get(&engine, "TaskMetadata", "QmTask1"),
        Some(
            Entity::new()
                .with("title", "Write docs")
                .with("task", task_key(MANAGER, 1))
        )
    );
    // Malformed content falls back to defaults.
    assert_eq!(
        get(&engine, "TaskMetadata", "QmTask2"),
        Some(
            Entity::new()
                .with("title", "")
                .with("task", task_key(MANAGER, 2))
        )
    );
    // Failed fetches are dropped.
    assert_eq!(get(&engine, "TaskMetadata", "QmTask3"), None);
}

#[tokio::test]
async fn refetches_content_of_reorged_blocks() {
    let resolver = Fixed::new();
    resolver.insert("QmTask1", br#"{"title":"Write docs"}"#.to_vec());
    let (mut engine, mut feed) = setup(Memory::new(), resolver, settings()).await;
    let metadata = Entity::new()
        .with("title", "Write docs")
        .with("task", task_key(MANAGER, 1));

    feed.push_block(block(1, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]));
    drain(&mut engine, &mut feed).await.unwrap();
    engine.settle().await;
    feed.push_block(block(2, vec![]));
    drain(&mut engine, &mut feed).await.unwrap();
    assert_eq!(get(&engine, "TaskMetadata", "QmTask1"), Some(metadata.clone()));
    assert_eq!(
        engine.database().handled().unwrap(),
        [Source::Content("QmTask1".to_owned())]
    );

    // The content was handled in the reorged block, so it is fetched again.
    feed.push_reorg(2, 2);
    drain(&mut engine, &mut feed).await.unwrap();
    assert_eq!(get(&engine, "TaskMetadata", "QmTask1"), None);
    assert_eq!(engine.fetches.pending(), 1);

    feed.push_block(block(2, vec![]));
    drain(&mut engine, &mut feed).await.unwrap();
    engine.settle().await;
    feed.push_block(block(3, vec![]));
    drain(&mut engine, &mut feed).await.unwrap();
    assert_eq!(get(&engine, "TaskMetadata", "QmTask1"), Some(metadata));
    assert_eq!(engine.fetches.pending(), 0);
}

#[tokio::test]
async fn resumes_unhandled_content_after_restart() {
    let url = database_url("content");
    let resolver = Fixed::new();
    resolver.insert("QmTask1", br#"{"title":"Write docs"}"#.to_vec());
    let first = block(1, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]);

    let restart = |resolver: Fixed| {
        let mut engine =
            Engine::new(Sqlite::open(&url).unwrap(), registry(), Arc::new(resolver), settings())
                .unwrap();
        engine
            .watch(static_source(FACTORY, "TaskManagerFactory"))
            .unwrap();
        let mut feed = Scripted::new();
        feed.push_block(first.clone());
        (engine, feed)
    };

    // Stopped before the content was handled.
    {
        let (mut engine, mut feed) = restart(resolver.clone());
        engine.start(&mut feed).await.unwrap();
        drain(&mut engine, &mut feed).await.unwrap();
        assert_eq!(engine.fetches.pending(), 1);
    }

    {
        let (mut engine, mut feed) = restart(resolver.clone());
        engine.start(&mut feed).await.unwrap();
        assert_eq!(engine.fetches.pending(), 1);

        engine.settle().await;
        feed.push_block(block(2, vec![]));
        assert_eq!(
            drain(&mut engine, &mut feed).await.unwrap(),
            [Some(Outcome::Duplicate), Some(Outcome::Committed)]
        );
        assert_eq!(
            get(&engine, "TaskMetadata", "QmTask1"),
            Some(
                Entity::new()
                    .with("title", "Write docs")
                    .with("task", task_key(MANAGER, 1))
            )
        );
    }

    // Handled content is not fetched again.
    let (mut engine, mut feed) = restart(resolver);
    feed.push_block(block(2, vec![]));
    engine.start(&mut feed).await.unwrap();
    assert_eq!(engine.head().map(|head| head.number), Some(2));
    assert_eq!(engine.fetches.pending(), 0);
}

#[tokio::test]
async fn rolls_back_blocks_reorged_while_stopped() {
    let url = database_url("reorg");
    let open = || {
        let mut engine = Engine::new(
            Sqlite::open(&url).unwrap(),
            registry(),
            Arc::new(Fixed::new()),
            settings(),
        )
        .unwrap();
        engine
            .watch(static_source(FACTORY, "TaskManagerFactory"))
            .unwrap();
        engine
    };
    let first = block(1, vec![manager(MANAGER, 0), created(MANAGER, 1, 1, 10)]);

    {
        let mut feed = Scripted::new();
        let mut engine = open();
        engine.start(&mut feed).await.unwrap();
        feed.push_block(first.clone());
        feed.push_block(block(2, vec![updated(MANAGER, 0, 1, 20)]));
        feed.push_block(block(3, vec![updated(MANAGER, 0, 1, 30)]));
        drain(&mut engine, &mut feed).await.unwrap();
        assert_eq!(engine.head().map(|head| head.number), Some(3));
    }

    // Blocks 2 and 3 were replaced while the indexer was stopped.
    let mut feed = Scripted::new();
    feed.push_block(first);
    let mut fork = block(2, vec![updated(MANAGER, 0, 1, 25)]);
    fork.hash = Digest([0xee; 32]);
    feed.push_block(fork);
    let mut next = block(3, vec![]);
    next.hash = Digest([0xef; 32]);
    next.parent_hash = Digest([0xee; 32]);
    feed.push_block(next);

    let mut engine = open();
    engine.start(&mut feed).await.unwrap();
    assert_eq!(engine.head().map(|head| head.number), Some(1));
    let task = get(&engine, "Task", &task_key(MANAGER, 1)).unwrap();
    assert_eq!(int(&task, "payout"), 10);

    assert_eq!(
        drain(&mut engine, &mut feed).await.unwrap(),
        [
            Some(Outcome::Duplicate),
            Some(Outcome::Committed),
            Some(Outcome::Committed)
        ]
    );
    let task = get(&engine, "Task", &task_key(MANAGER, 1)).unwrap();
    assert_eq!(int(&task, "payout"), 25);
    assert_eq!(engine.head().map(|head| head.hash), Some(Digest([0xef; 32])));
}
