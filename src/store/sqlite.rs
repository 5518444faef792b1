use super::{check_commit, Change, Commit, Database};
use crate::{
    sources::{Source, WatchedSource},
    trigger::BlockPtr,
    value::{Entity, EntityKey},
};
use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction};
use solabi::ethprim::Digest;
use std::env;
use url::Url;

/// SQLite backed versioned store. Entities are stored as JSON documents, one
/// row per entity version.
pub struct Sqlite {
    connection: Connection,
}

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS _blocks(number INTEGER PRIMARY KEY NOT NULL, hash BLOB NOT NULL) STRICT;
CREATE TABLE IF NOT EXISTS _entities(entity_type TEXT NOT NULL, id TEXT NOT NULL, block INTEGER NOT NULL, data TEXT, PRIMARY KEY(entity_type ASC, id ASC, block ASC)) STRICT;
CREATE TABLE IF NOT EXISTS _sources(source TEXT PRIMARY KEY NOT NULL, block INTEGER NOT NULL, data TEXT NOT NULL) STRICT;
CREATE TABLE IF NOT EXISTS _handled(source TEXT PRIMARY KEY NOT NULL, block INTEGER NOT NULL) STRICT;
";

const GET_HEAD: &str = "SELECT number, hash FROM _blocks ORDER BY number DESC LIMIT 1;";
const INSERT_BLOCK: &str = "INSERT INTO _blocks (number, hash) VALUES(?1, ?2);";
const GET_ENTITY: &str = "SELECT data FROM _entities WHERE entity_type = ?1 AND id = ?2 AND block <= ?3 ORDER BY block DESC LIMIT 1;";
const FIND_ENTITIES: &str = "SELECT e.id, e.data FROM _entities e WHERE e.entity_type = ?1 AND e.data IS NOT NULL AND e.block = (SELECT MAX(v.block) FROM _entities v WHERE v.entity_type = e.entity_type AND v.id = e.id AND v.block <= ?2) ORDER BY e.id ASC;";
const INSERT_ENTITY: &str =
    "INSERT INTO _entities (entity_type, id, block, data) VALUES(?1, ?2, ?3, ?4);";
const GET_SOURCES: &str = "SELECT data FROM _sources ORDER BY block ASC, source ASC;";
const INSERT_SOURCE: &str = "INSERT INTO _sources (source, block, data) VALUES(?1, ?2, ?3);";
const GET_HANDLED: &str = "SELECT source FROM _handled ORDER BY block ASC, source ASC;";
const INSERT_HANDLED: &str = "INSERT OR IGNORE INTO _handled (source, block) VALUES(?1, ?2);";
const REVERT_BLOCKS: &str = "DELETE FROM _blocks WHERE number > ?1;";
const REVERT_ENTITIES: &str = "DELETE FROM _entities WHERE block > ?1;";
const REVERT_SOURCES: &str = "DELETE FROM _sources WHERE block > ?1;";
const REVERT_HANDLED: &str = "DELETE FROM _handled WHERE block > ?1;";

impl Sqlite {
    pub fn new(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(CREATE_TABLES)
            .context("create tables")?;

        // Check that all statements are valid up front.
        for statement in [
            GET_HEAD,
            INSERT_BLOCK,
            GET_ENTITY,
            FIND_ENTITIES,
            INSERT_ENTITY,
            GET_SOURCES,
            INSERT_SOURCE,
            GET_HANDLED,
            INSERT_HANDLED,
            REVERT_BLOCKS,
            REVERT_ENTITIES,
            REVERT_SOURCES,
            REVERT_HANDLED,
        ] {
            connection
                .prepare_cached(statement)
                .with_context(|| format!("prepare {statement}"))?;
        }

        Ok(Self { connection })
    }

    /// Opens a new SQLite database backend for the specified URL. The expected
    /// URL format is `sqlite://[/path[?query]]`. For example:
    ///
    /// - `sqlite://` to open and in-memory connection
    /// - `sqlite:///relative/foo.db` to open the file `relative/foo.db`
    /// - `sqlite:////absolute/foo.db` to open the file `/absolute/foo.db`
    ///
    /// Addionally, query string parameters can be set to configure database
    /// connection options. See <https://www.sqlite.org/uri.html> for supported
    /// query string paramters.
    pub fn open(url: &Url) -> Result<Self> {
        anyhow::ensure!(url.scheme() == "sqlite", "not an sqlite:// URL");
        anyhow::ensure!(
            url.has_authority() && url.authority() == "",
            "sqlite:// URL requires empty authority"
        );
        anyhow::ensure!(
            url.fragment().is_none(),
            "sqlite:// URL does not support fragments"
        );

        if url.path().is_empty() {
            tracing::debug!("opening in-memory database");
            return Self::new(Connection::open_in_memory()?);
        };

        // SQLite 3 supports connection strings as file:// URLs, convert our
        // `sqlite://` to that.
        let path = env::current_dir()?.join(
            url.path()
                .strip_prefix('/')
                .context("sqlite:// URL path not prefixed with /")?,
        );
        let mut file = Url::from_file_path(path)
            .ok()
            .context("invalid sqlite:// URL file path")?;
        if let Some(query) = url.query() {
            file.set_query(Some(query));
        }

        tracing::debug!("opening database {file}");
        let connection = Connection::open_with_flags(
            file.as_str(),
            OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
        )?;

        Self::new(connection)
    }

    #[cfg(test)]
    /// Create a temporary in memory database for tests.
    pub fn new_for_test() -> Self {
        Self::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn insert(transaction: &Transaction, commit: &Commit) -> Result<()> {
        let block = to_sql(commit.block.number)?;
        transaction
            .prepare_cached(INSERT_BLOCK)
            .context("prepare_cached insert_block")?
            .execute((block, &commit.block.hash.0[..]))
            .context("execute insert_block")?;

        let mut insert_entity = transaction
            .prepare_cached(INSERT_ENTITY)
            .context("prepare_cached insert_entity")?;
        for change in commit.changes {
            let data = match change {
                Change::Set(_, entity) => Some(serde_json::to_string(entity)?),
                Change::Remove(_) => None,
            };
            let key = change.key();
            insert_entity
                .execute((&key.entity_type, &key.id, block, data))
                .with_context(|| format!("execute insert_entity {key}"))?;
        }

        let mut insert_source = transaction
            .prepare_cached(INSERT_SOURCE)
            .context("prepare_cached insert_source")?;
        for source in commit.sources {
            insert_source
                .execute((
                    serde_json::to_string(&source.source)?,
                    block,
                    serde_json::to_string(source)?,
                ))
                .with_context(|| format!("execute insert_source {}", source.source))?;
        }

        let mut insert_handled = transaction
            .prepare_cached(INSERT_HANDLED)
            .context("prepare_cached insert_handled")?;
        for source in commit.handled {
            insert_handled
                .execute((serde_json::to_string(source)?, block))
                .with_context(|| format!("execute insert_handled {source}"))?;
        }
        Ok(())
    }
}

impl Database for Sqlite {
    fn head(&self) -> Result<Option<BlockPtr>> {
        let row = self
            .connection
            .prepare_cached(GET_HEAD)
            .context("prepare_cached get_head")?
            .query_row((), |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .optional()
            .context("query_row get_head")?;
        let Some((number, hash)) = row else {
            return Ok(None);
        };
        Ok(Some(BlockPtr {
            number: number.try_into().context("block number out of bounds")?,
            hash: Digest(
                hash.as_slice()
                    .try_into()
                    .context("block hash has invalid length")?,
            ),
        }))
    }

    fn get(&self, key: &EntityKey, block: Option<u64>) -> Result<Option<Entity>> {
        let block = block.map(to_sql).transpose()?.unwrap_or(i64::MAX);
        let data = self
            .connection
            .prepare_cached(GET_ENTITY)
            .context("prepare_cached get_entity")?
            .query_row((&key.entity_type, &key.id, block), |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .context("query_row get_entity")?
            .flatten();
        data.map(|data| serde_json::from_str(&data).context("invalid entity data"))
            .transpose()
    }

    fn find(&self, entity_type: &str, block: Option<u64>) -> Result<Vec<(String, Entity)>> {
        let block = block.map(to_sql).transpose()?.unwrap_or(i64::MAX);
        let mut statement = self
            .connection
            .prepare_cached(FIND_ENTITIES)
            .context("prepare_cached find_entities")?;
        let rows = statement
            .query_map((entity_type, block), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("query find_entities")?;
        rows.map(|row| -> Result<(String, Entity)> {
            let (id, data) = row?;
            let entity = serde_json::from_str(&data)
                .with_context(|| format!("invalid entity data for {entity_type}[{id}]"))?;
            Ok((id, entity))
        })
        .collect()
    }

    fn sources(&self) -> Result<Vec<WatchedSource>> {
        let mut statement = self
            .connection
            .prepare_cached(GET_SOURCES)
            .context("prepare_cached get_sources")?;
        let rows = statement
            .query_map((), |row| row.get::<_, String>(0))
            .context("query get_sources")?;
        rows.map(|row| -> Result<WatchedSource> {
            serde_json::from_str(&row?).context("invalid source data")
        })
        .collect()
    }

    fn handled(&self) -> Result<Vec<Source>> {
        let mut statement = self
            .connection
            .prepare_cached(GET_HANDLED)
            .context("prepare_cached get_handled")?;
        let rows = statement
            .query_map((), |row| row.get::<_, String>(0))
            .context("query get_handled")?;
        rows.map(|row| -> Result<Source> {
            serde_json::from_str(&row?).context("invalid handled source")
        })
        .collect()
    }

    fn commit(&mut self, commit: &Commit) -> Result<()> {
        check_commit(self.head()?, commit)?;
        let transaction = self.connection.transaction().context("transaction")?;
        Self::insert(&transaction, commit)?;
        transaction.commit().context("commit")
    }

    fn revert(&mut self, block: u64) -> Result<()> {
        let block = to_sql(block)?;
        let transaction = self.connection.transaction().context("transaction")?;
        for statement in [
            REVERT_BLOCKS,
            REVERT_ENTITIES,
            REVERT_SOURCES,
            REVERT_HANDLED,
        ] {
            transaction
                .prepare_cached(statement)
                .context("prepare_cached revert")?
                .execute((block,))
                .with_context(|| format!("execute {statement}"))?;
        }
        transaction.commit().context("commit")
    }
}

fn to_sql(block: u64) -> Result<i64> {
    block.try_into().context("block out of bounds")
}
