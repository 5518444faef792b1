//! Read-only access to committed entities, either at the head or pinned to a
//! historical block.

use crate::{
    engine::Status,
    store::Database,
    value::{Entity, EntityKey, Value},
};
use std::{borrow::Cow, cmp::Ordering};

/// The page size for requests without a limit.
pub const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("index halted at block {block}: {error}")]
    Halted { block: u64, error: String },
    #[error("block {requested} is not indexed (head {head:?})")]
    BlockNotIndexed { requested: u64, head: Option<u64> },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A condition on an entity field. The field `id` refers to the entity id;
/// absent fields compare as `Null`.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Equal(String, Value),
    NotEqual(String, Value),
    GreaterThan(String, Value),
    LessThan(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    fn matches(&self, id: &str, entity: &Entity) -> bool {
        match self {
            Self::Equal(name, value) => *field(id, entity, name) == *value,
            Self::NotEqual(name, value) => *field(id, entity, name) != *value,
            Self::GreaterThan(name, value) => {
                field(id, entity, name).compare(value) == Some(Ordering::Greater)
            }
            Self::LessThan(name, value) => {
                field(id, entity, name).compare(value) == Some(Ordering::Less)
            }
            Self::In(name, values) => values.contains(field(id, entity, name).as_ref()),
        }
    }
}

fn field<'a>(id: &'a str, entity: &'a Entity, name: &str) -> Cow<'a, Value> {
    if name == "id" {
        return Cow::Owned(Value::String(id.to_owned()));
    }
    match entity.get(name) {
        Some(value) => Cow::Borrowed(value),
        None => Cow::Owned(Value::Null),
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Continues a query where a previous page ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cursor(usize);

/// A request for a page of entities of one type.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub entity_type: String,
    pub filters: Vec<Filter>,
    /// Entities are ordered by id if no field is specified. Ties are always
    /// broken by id.
    pub order_by: Option<OrderBy>,
    pub limit: usize,
    pub cursor: Option<Cursor>,
    /// Query state as of this block instead of the head.
    pub block: Option<u64>,
}

impl Request {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_owned(),
            filters: Vec::new(),
            order_by: None,
            limit: DEFAULT_LIMIT,
            cursor: None,
            block: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_owned(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn at(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub entities: Vec<(String, Entity)>,
    /// Set if there are more entities.
    pub cursor: Option<Cursor>,
}

/// A query view of committed state.
pub struct Query<'a> {
    database: &'a dyn Database,
    status: &'a Status,
}

impl<'a> Query<'a> {
    pub fn new(database: &'a dyn Database, status: &'a Status) -> Self {
        Self { database, status }
    }

    pub fn get_entity(
        &self,
        entity_type: &str,
        id: &str,
        block: Option<u64>,
    ) -> Result<Option<Entity>, QueryError> {
        let block = self.check(block)?;
        Ok(self
            .database
            .get(&EntityKey::new(entity_type, id), block)?)
    }

    pub fn query_entities(&self, request: &Request) -> Result<Page, QueryError> {
        let block = self.check(request.block)?;
        let mut entities = self
            .database
            .find(&request.entity_type, block)?
            .into_iter()
            .filter(|(id, entity)| {
                request
                    .filters
                    .iter()
                    .all(|filter| filter.matches(id, entity))
            })
            .collect::<Vec<_>>();

        if let Some(order) = &request.order_by {
            entities.sort_by(|(a_id, a), (b_id, b)| {
                let ordering =
                    field(a_id, a, &order.field).total_cmp(&field(b_id, b, &order.field));
                let ordering = match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                };
                ordering.then_with(|| a_id.cmp(b_id))
            });
        }

        let offset = request.cursor.map(|Cursor(offset)| offset).unwrap_or(0);
        let end = offset.saturating_add(request.limit);
        let cursor = (end < entities.len()).then_some(Cursor(end));
        let entities = entities
            .into_iter()
            .skip(offset)
            .take(request.limit)
            .collect();

        Ok(Page { entities, cursor })
    }

    fn check(&self, block: Option<u64>) -> Result<Option<u64>, QueryError> {
        if let Status::Halted { block, error } = self.status {
            return Err(QueryError::Halted {
                block: *block,
                error: error.clone(),
            });
        }
        if let Some(requested) = block {
            let head = self.database.head()?.map(|head| head.number);
            if head.map_or(true, |head| requested > head) {
                return Err(QueryError::BlockNotIndexed { requested, head });
            }
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{tests::ptr, Change, Commit, Memory};

    fn task(id: &str, payout: u64, completed: bool) -> Change {
        Change::Set(
            EntityKey::new("Task", id),
            Entity::new()
                .with("payout", payout)
                .with("completed", completed),
        )
    }

    fn database() -> Memory {
        let mut memory = Memory::new();
        memory
            .commit(&Commit {
                block: ptr(1),
                changes: &[
                    task("a", 30, false),
                    task("b", 10, true),
                    task("c", 20, false),
                    task("d", 20, true),
                ],
                sources: &[],
                handled: &[],
            })
            .unwrap();
        memory
            .commit(&Commit {
                block: ptr(2),
                changes: &[
                    task("a", 5, true),
                    Change::Remove(EntityKey::new("Task", "b")),
                ],
                sources: &[],
                handled: &[],
            })
            .unwrap();
        memory
    }

    fn ids(page: &Page) -> Vec<&str> {
        page.entities.iter().map(|(id, _)| id.as_str()).collect()
    }

    #[test]
    fn gets_entities() {
        let database = database();
        let query = Query::new(&database, &Status::Healthy);

        assert_eq!(
            query.get_entity("Task", "a", None).unwrap(),
            Some(Entity::new().with("payout", 5_u64).with("completed", true))
        );
        assert_eq!(
            query.get_entity("Task", "a", Some(1)).unwrap(),
            Some(Entity::new().with("payout", 30_u64).with("completed", false))
        );
        assert_eq!(query.get_entity("Task", "b", None).unwrap(), None);
        assert!(query.get_entity("Task", "b", Some(1)).unwrap().is_some());
        assert!(matches!(
            query.get_entity("Task", "a", Some(3)),
            Err(QueryError::BlockNotIndexed {
                requested: 3,
                head: Some(2)
            })
        ));
    }

    #[test]
    fn filters_and_orders() {
        let database = database();
        let query = Query::new(&database, &Status::Healthy);

        let page = query
            .query_entities(
                &Request::new("Task")
                    .filter(Filter::Equal("completed".to_owned(), true.into()))
                    .order_by("payout", Direction::Descending),
            )
            .unwrap();
        assert_eq!(ids(&page), ["d", "a"]);
        assert_eq!(page.cursor, None);

        let page = query
            .query_entities(
                &Request::new("Task")
                    .filter(Filter::GreaterThan("payout".to_owned(), 5_u64.into()))
                    .order_by("payout", Direction::Ascending),
            )
            .unwrap();
        assert_eq!(ids(&page), ["c", "d"]);

        let page = query
            .query_entities(&Request::new("Task").filter(Filter::In(
                "id".to_owned(),
                vec!["a".into(), "b".into(), "d".into()],
            )))
            .unwrap();
        assert_eq!(ids(&page), ["a", "d"]);

        let page = query
            .query_entities(
                &Request::new("Task")
                    .filter(Filter::NotEqual("completed".to_owned(), true.into()))
                    .filter(Filter::LessThan("payout".to_owned(), 100_u64.into())),
            )
            .unwrap();
        assert_eq!(ids(&page), ["c"]);
    }

    #[test]
    fn orders_fields_of_mixed_kinds() {
        let mut database = Memory::new();
        let entity = |id: &str, label: Value| {
            Change::Set(EntityKey::new("Label", id), Entity::new().with("label", label))
        };
        database
            .commit(&Commit {
                block: ptr(1),
                changes: &[
                    entity("a", "x".into()),
                    entity("b", 3_u64.into()),
                    entity("c", Value::Null),
                    entity("d", true.into()),
                    entity("e", 1_u64.into()),
                ],
                sources: &[],
                handled: &[],
            })
            .unwrap();
        let query = Query::new(&database, &Status::Healthy);

        let page = query
            .query_entities(&Request::new("Label").order_by("label", Direction::Ascending))
            .unwrap();
        assert_eq!(ids(&page), ["c", "d", "e", "b", "a"]);
        let page = query
            .query_entities(&Request::new("Label").order_by("label", Direction::Descending))
            .unwrap();
        assert_eq!(ids(&page), ["a", "b", "e", "d", "c"]);
    }

    #[test]
    fn paginates() {
        let database = database();
        let query = Query::new(&database, &Status::Healthy);

        let request = Request::new("Task").at(1).limit(3);
        let first = query.query_entities(&request).unwrap();
        assert_eq!(ids(&first), ["a", "b", "c"]);
        let cursor = first.cursor.unwrap();

        let second = query.query_entities(&request.after(cursor)).unwrap();
        assert_eq!(ids(&second), ["d"]);
        assert_eq!(second.cursor, None);
    }

    #[test]
    fn refuses_queries_when_halted() {
        let database = database();
        let status = Status::Halted {
            block: 3,
            error: "invariant violation".to_owned(),
        };
        let query = Query::new(&database, &status);

        assert!(matches!(
            query.get_entity("Task", "a", None),
            Err(QueryError::Halted { block: 3, .. })
        ));
        assert!(matches!(
            query.query_entities(&Request::new("Task")),
            Err(QueryError::Halted { block: 3, .. })
        ));
    }
}
