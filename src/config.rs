use crate::{
    handlers::{Create, Record, RecordContent},
    registry::{Registry, TemplateKind},
    sources::{Origin, Source as WatchedAddress, WatchedSource},
};
use anyhow::{Context, Result};
use serde::Deserialize;
use solabi::{abi::EventDescriptor, ethprim::Address};
use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use url::Url;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub ethrpc: Url,
    pub database: Url,
    /// Directory of content addressed files. Content resolution is disabled
    /// without it.
    pub content_dir: Option<PathBuf>,
    #[serde(default)]
    pub indexer: Indexer,
    #[serde(rename = "template", default)]
    pub templates: Vec<Template>,
    #[serde(rename = "source", default)]
    pub sources: Vec<Source>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Indexer {
    pub page_size: u64,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    pub retries: u32,
    #[serde(with = "duration")]
    pub retry_interval: Duration,
    pub strict: bool,
}

impl Default for Indexer {
    fn default() -> Self {
        Self {
            page_size: 1000,
            poll_interval: Duration::from_secs(1),
            retries: 3,
            retry_interval: Duration::from_secs(1),
            strict: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Template {
    pub name: String,
    pub kind: TemplateKind,
    #[serde(rename = "event", default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct Event {
    #[serde(with = "signature")]
    pub signature: EventDescriptor,
    pub create: Option<Create>,
}

/// A contract to index from a start block on.
#[derive(Debug, Deserialize)]
pub struct Source {
    pub name: String,
    pub template: String,
    pub address: Address,
    #[serde(default)]
    pub start: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let toml = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&toml)?;
        Ok(config)
    }

    /// Builds a registry with the generic record handlers for every
    /// configured template.
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        for template in &self.templates {
            registry.template(&template.name, template.kind)?;
            match template.kind {
                TemplateKind::Contract => {
                    for event in &template.events {
                        registry.register_event(
                            &template.name,
                            event.signature.clone(),
                            Arc::new(Record::new(event.create.clone())),
                        )?;
                    }
                }
                TemplateKind::Content => {
                    anyhow::ensure!(
                        template.events.is_empty(),
                        "content template {} can't have events",
                        template.name
                    );
                    registry.register_content(&template.name, RecordContent)?;
                }
            }
        }
        Ok(registry)
    }

    /// The statically configured sources.
    pub fn watched_sources(&self) -> Vec<WatchedSource> {
        self.sources
            .iter()
            .map(|source| WatchedSource {
                source: WatchedAddress::Contract(source.address),
                template: source.template.clone(),
                context: BTreeMap::new(),
                origin: Origin::Static {
                    start: source.start,
                },
            })
            .collect()
    }

    /// The first block any source needs.
    pub fn start(&self) -> u64 {
        self.sources
            .iter()
            .map(|source| source.start)
            .min()
            .unwrap_or_default()
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("ethrpc", &self.ethrpc.as_str())
            .field("database", &self.database.as_str())
            .field("content-dir", &self.content_dir)
            .field("indexer", &self.indexer)
            .field("template", &self.templates)
            .field("source", &self.sources)
            .finish()
    }
}

mod signature {
    use serde::{de, Deserialize, Deserializer};
    use solabi::abi::EventDescriptor;
    use std::borrow::Cow;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<EventDescriptor, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Cow::<str>::deserialize(deserializer)?;
        EventDescriptor::parse_declaration(s.as_ref()).map_err(de::Error::custom)
    }
}

/// Durations in (fractional) seconds.
mod duration {
    use serde::{de, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
