//! The handler registry. Handlers are registered per template and event
//! signature; watched sources are bound to a template, so one handler can
//! service any number of runtime-created contract instances.
//!
//! The registry is also responsible for decoding raw log topics and data into
//! named parameters for the event a handler was registered for.

use crate::{
    engine::Context,
    trigger::{RawLog, Trigger},
    value::Value,
};
use anyhow::{Context as _, Result};
use serde::Deserialize;
use solabi::{
    abi::EventDescriptor,
    ethprim::Digest,
    value::EventEncoder,
};
use std::{
    borrow::Cow,
    collections::{hash_map, HashMap},
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

/// A function invoked once per matching trigger. Side effects are limited to
/// the store and source operations exposed by the [`Context`].
pub trait Handler: Send + Sync {
    fn handle(&self, trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Trigger, &mut Context) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, trigger: &Trigger, ctx: &mut Context) -> Result<(), HandlerError> {
        self(trigger, ctx)
    }
}

/// Errors a handler can return.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// An entity the handler expected to exist is absent. Unless the engine
    /// runs in strict mode, the remainder of the handler is skipped and the
    /// block continues.
    #[error("{entity_type} {id} not found")]
    MissingReference { entity_type: String, id: String },
    /// Fails the block.
    #[error(transparent)]
    Unrecoverable(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn missing(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::MissingReference {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// An arithmetic or other data invariant was violated.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Unrecoverable(anyhow::anyhow!(
            "invariant violation: {}",
            message.into()
        ))
    }
}

/// The kind of sources a template is bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Contract,
    Content,
}

/// A log handler together with the decoder for its event.
pub struct Binding {
    descriptor: EventDescriptor,
    encoder: EventEncoder,
    handler: Arc<dyn Handler>,
}

impl Binding {
    pub fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    pub fn handler(&self) -> &dyn Handler {
        &*self.handler
    }

    /// Decodes a raw log into the event's named parameters.
    pub fn decode(&self, log: &RawLog) -> Result<Vec<(String, Value)>> {
        let fields = self.encoder.decode(&solabi::log::Log {
            topics: {
                let mut converted = solabi::log::Topics::default();
                for topic in &log.topics {
                    converted.push(topic);
                }
                converted
            },
            data: Cow::Borrowed(&log.data),
        })?;
        Ok(self
            .descriptor
            .inputs
            .iter()
            .zip(&fields)
            .enumerate()
            .map(|(i, (input, value))| {
                let name = if input.field.name.is_empty() {
                    format!("param{i}")
                } else {
                    input.field.name.clone()
                };
                (name, Value::from_abi(value))
            })
            .collect())
    }
}

struct Template {
    kind: TemplateKind,
    events: HashMap<Digest, Binding>,
    content: Option<Arc<dyn Handler>>,
}

/// Maps `(template, signature)` to handlers.
#[derive(Default)]
pub struct Registry {
    templates: HashMap<String, Template>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a new template.
    pub fn template(&mut self, name: &str, kind: TemplateKind) -> Result<()> {
        let hash_map::Entry::Vacant(entry) = self.templates.entry(name.to_owned()) else {
            anyhow::bail!("duplicate template {name}");
        };
        entry.insert(Template {
            kind,
            events: HashMap::new(),
            content: None,
        });
        Ok(())
    }

    pub fn kind(&self, template: &str) -> Option<TemplateKind> {
        Some(self.templates.get(template)?.kind)
    }

    /// Registers a handler for a Solidity event declaration, for example
    /// `event Transfer(address indexed from, address indexed to, uint256 value)`.
    pub fn register(
        &mut self,
        template: &str,
        declaration: &str,
        handler: impl Handler + 'static,
    ) -> Result<()> {
        let descriptor = EventDescriptor::parse_declaration(declaration)
            .with_context(|| format!("invalid event declaration {declaration:?}"))?;
        self.register_event(template, descriptor, Arc::new(handler))
    }

    /// Registers a handler for an already parsed event descriptor.
    pub fn register_event(
        &mut self,
        template: &str,
        descriptor: EventDescriptor,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let entry = self.contract_template(template)?;
        let selector = Digest(
            descriptor
                .selector()
                .context("anonymous events are not supported")?,
        );
        let encoder = EventEncoder::new(&descriptor)?;

        let hash_map::Entry::Vacant(slot) = entry.events.entry(selector) else {
            anyhow::bail!(
                "duplicate handler for event {} in template {template}",
                descriptor.name
            );
        };
        slot.insert(Binding {
            descriptor,
            encoder,
            handler,
        });
        Ok(())
    }

    /// Registers the handler for resolved content of a content template.
    pub fn register_content(
        &mut self,
        template: &str,
        handler: impl Handler + 'static,
    ) -> Result<()> {
        let entry = self
            .templates
            .get_mut(template)
            .with_context(|| format!("unknown template {template}"))?;
        anyhow::ensure!(
            entry.kind == TemplateKind::Content,
            "template {template} is not a content template"
        );
        anyhow::ensure!(
            entry.content.is_none(),
            "duplicate content handler for template {template}"
        );
        entry.content = Some(Arc::new(handler));
        Ok(())
    }

    /// Resolves the binding for a log emitted by a source bound to
    /// `template`. Returns `None` if no handler is registered, which is not
    /// an error.
    pub fn resolve(&self, template: &str, log: &RawLog) -> Option<&Binding> {
        let selector = log.topics.first()?;
        self.templates.get(template)?.events.get(selector)
    }

    pub fn resolve_content(&self, template: &str) -> Option<&dyn Handler> {
        self.templates.get(template)?.content.as_deref()
    }

    fn contract_template(&mut self, template: &str) -> Result<&mut Template> {
        let entry = self
            .templates
            .get_mut(template)
            .with_context(|| format!("unknown template {template}"))?;
        anyhow::ensure!(
            entry.kind == TemplateKind::Contract,
            "template {template} is not a contract template"
        );
        Ok(entry)
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.templates.iter().map(|(name, template)| {
                (
                    name,
                    template
                        .events
                        .values()
                        .map(|binding| binding.descriptor.name.as_str())
                        .collect::<Vec<_>>(),
                )
            }))
            .finish()
    }
}
