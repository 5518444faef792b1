//! Watched sources: the contract addresses and content hashes that handlers
//! observe, together with the template that handles them and their
//! write-once context.

use crate::{trigger::Position, value::Value};
use serde::{Deserialize, Serialize};
use solabi::ethprim::Address;
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display, Formatter},
};

/// Something that can be watched.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Contract(#[serde(with = "crate::value::address")] Address),
    Content(String),
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Contract(address) => write!(f, "0x{}", hex::encode(address.0)),
            Self::Content(hash) => f.write_str(hash),
        }
    }
}

/// Where a watched source came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Declared in configuration. Observes everything from `start` onwards.
    Static { start: u64 },
    /// Created by a handler at the specified position. Observes triggers
    /// strictly after its creation point.
    Dynamic {
        block: u64,
        transaction_index: u64,
        log_index: u64,
    },
}

impl Origin {
    pub fn dynamic(position: Position) -> Self {
        Self::Dynamic {
            block: position.block,
            transaction_index: position.transaction_index,
            log_index: position.log_index,
        }
    }

    /// The block this source was created in, for dynamic sources.
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::Static { .. } => None,
            Self::Dynamic { block, .. } => Some(*block),
        }
    }

    pub fn observes(&self, position: Position) -> bool {
        match *self {
            Self::Static { start } => position.block >= start,
            Self::Dynamic {
                block,
                transaction_index,
                log_index,
            } => position > Position::new(block, transaction_index, log_index),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatchedSource {
    pub source: Source,
    pub template: String,
    pub context: BTreeMap<String, Value>,
    pub origin: Origin,
}

impl WatchedSource {
    pub fn is_dynamic(&self) -> bool {
        matches!(self.origin, Origin::Dynamic { .. })
    }
}

/// The committed set of watched sources.
#[derive(Debug, Default)]
pub struct Sources {
    watched: HashMap<Source, WatchedSource>,
}

impl Sources {
    pub fn new(sources: impl IntoIterator<Item = WatchedSource>) -> Self {
        let mut this = Self::default();
        this.extend(sources);
        this
    }

    pub fn get(&self, source: &Source) -> Option<&WatchedSource> {
        self.watched.get(source)
    }

    pub fn contains(&self, source: &Source) -> bool {
        self.watched.contains_key(source)
    }

    /// Reads a context value attached to a watched source.
    pub fn context(&self, source: &Source, key: &str) -> Option<&Value> {
        self.watched.get(source)?.context.get(key)
    }

    /// Adds sources. Sources that are already watched are left untouched,
    /// since they are immutable once created.
    pub fn extend(&mut self, sources: impl IntoIterator<Item = WatchedSource>) {
        for source in sources {
            self.watched.entry(source.source.clone()).or_insert(source);
        }
    }

    /// Forgets all dynamic sources created after `block`.
    pub fn revert(&mut self, block: u64) -> usize {
        let before = self.watched.len();
        self.watched.retain(|_, watched| match watched.origin.block() {
            Some(created) => created <= block,
            None => true,
        });
        before - self.watched.len()
    }

    /// Iterates over the addresses of all watched contracts.
    pub fn contracts(&self) -> impl Iterator<Item = (Address, &WatchedSource)> {
        self.watched.values().filter_map(|watched| match watched.source {
            Source::Contract(address) => Some((address, watched)),
            Source::Content(_) => None,
        })
    }

    /// Iterates over the hashes of all watched content sources.
    pub fn contents(&self) -> impl Iterator<Item = &str> {
        self.watched.keys().filter_map(|source| match source {
            Source::Contract(_) => None,
            Source::Content(hash) => Some(hash.as_str()),
        })
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }
}
