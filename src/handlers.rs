//! Generic handlers driven by configuration. They materialize events and
//! resolved content as entities without any domain specific logic.

use crate::{
    engine::Context,
    registry::{Handler, HandlerError},
    sources::Source,
    trigger::Trigger,
    value::{Entity, Value},
};
use anyhow::{anyhow, Context as _};
use num_bigint::BigInt;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Spawns a new source from an event parameter: an address parameter creates
/// a contract instance, a string parameter a content source.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Create {
    pub template: String,
    pub param: String,
}

/// Saves every log as an entity named after the event, identified by the
/// log's transaction hash and index.
#[derive(Clone, Debug, Default)]
pub struct Record {
    create: Option<Create>,
}

impl Record {
    pub fn new(create: Option<Create>) -> Self {
        Self { create }
    }
}

impl Handler for Record {
    fn handle(&self, trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
        let log = trigger
            .as_log()
            .ok_or_else(|| anyhow!("expected a log trigger"))?;

        let mut entity = log.params.iter().cloned().collect::<Entity>();
        for (field, value) in [
            ("block", Value::from(log.block.number)),
            ("timestamp", Value::from(log.timestamp)),
            ("transaction", Value::Bytes(log.transaction_hash.0.to_vec())),
            ("address", Value::Address(log.address)),
        ] {
            if entity.get(field).is_none() {
                entity.set(field, value);
            }
        }
        ctx.save(&log.event, &log.id(), entity);

        let Some(create) = &self.create else {
            return Ok(());
        };
        let source = match log
            .param(&create.param)
            .with_context(|| format!("{} has no parameter {}", log.event, create.param))?
        {
            Value::Address(address) => Source::Contract(*address),
            Value::String(hash) => Source::Content(hash.clone()),
            value => {
                return Err(anyhow!("can't create a source from {value}").into());
            }
        };
        ctx.create_instance(
            &create.template,
            source,
            BTreeMap::from([("creator".to_owned(), Value::Address(log.address))]),
        )
    }
}

/// Saves resolved content as an entity named after the content template,
/// identified by the content hash. The payload is read as a JSON object and
/// its scalar members become fields, along with the source's context.
/// Malformed content yields an entity without parsed fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordContent;

impl Handler for RecordContent {
    fn handle(&self, trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
        let content = trigger
            .as_content()
            .ok_or_else(|| anyhow!("expected a content trigger"))?;

        let mut entity = Entity::new();
        match serde_json::from_slice::<serde_json::Value>(&content.payload) {
            Ok(serde_json::Value::Object(members)) => {
                for (name, value) in members {
                    if let Some(value) = scalar(value) {
                        entity.set(&name, value);
                    }
                }
            }
            Ok(_) => tracing::warn!(hash = %content.hash, "content is not a JSON object"),
            Err(err) => tracing::warn!(hash = %content.hash, ?err, "malformed content"),
        }
        for (key, value) in &ctx.source().context {
            if entity.get(key).is_none() {
                entity.set(key, value.clone());
            }
        }

        let entity_type = ctx.source().template.clone();
        ctx.save(&entity_type, &content.hash, entity);
        Ok(())
    }
}

fn scalar(value: serde_json::Value) -> Option<Value> {
    Some(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(value) => Value::Bool(value),
        serde_json::Value::String(value) => Value::String(value),
        serde_json::Value::Number(number) => {
            if let Some(value) = number.as_u64() {
                Value::Int(BigInt::from(value))
            } else if let Some(value) = number.as_i64() {
                Value::Int(BigInt::from(value))
            } else {
                Value::String(number.to_string())
            }
        }
        serde_json::Value::Array(values) => {
            Value::List(values.into_iter().filter_map(scalar).collect())
        }
        serde_json::Value::Object(_) => return None,
    })
}
