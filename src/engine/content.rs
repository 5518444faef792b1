//! Off-chain content resolution. Fetches run in the background; finished
//! fetches are collected by the engine and executed as content triggers in
//! the next block.

use anyhow::{Context, Result};
use futures::{
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
    FutureExt,
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Resolves content addresses (for example IPFS hashes) to payloads.
/// Timeouts and retries are the resolver's own policy.
pub trait Resolver: Send + Sync {
    fn fetch(&self, hash: &str) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Resolves content from files named by their hash in a local directory.
#[derive(Clone, Debug)]
pub struct Directory {
    root: PathBuf,
}

impl Directory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Resolver for Directory {
    fn fetch(&self, hash: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let valid = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric());
        let path = self.root.join(hash);
        let hash = hash.to_owned();
        async move {
            anyhow::ensure!(valid, "invalid content hash {hash:?}");
            tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))
        }
        .boxed()
    }
}

/// A resolver that never finds anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Disabled;

impl Resolver for Disabled {
    fn fetch(&self, hash: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let hash = hash.to_owned();
        async move { anyhow::bail!("content resolution is disabled, can't fetch {hash}") }.boxed()
    }
}

/// An in-memory resolver.
#[derive(Clone, Debug, Default)]
pub struct Fixed {
    contents: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Fixed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hash: &str, payload: impl Into<Vec<u8>>) {
        self.contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(hash.to_owned(), payload.into());
    }
}

impl Resolver for Fixed {
    fn fetch(&self, hash: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let payload = self
            .contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(hash)
            .cloned();
        let hash = hash.to_owned();
        async move { payload.with_context(|| format!("content {hash} not found")) }.boxed()
    }
}

/// The outcome of a fetch.
#[derive(Debug)]
pub struct Resolved {
    pub hash: String,
    pub result: Result<Vec<u8>>,
}

/// In-flight fetches. Every hash is fetched at most once until its result
/// was taken.
pub struct Fetches {
    resolver: Arc<dyn Resolver>,
    inflight: FuturesUnordered<BoxFuture<'static, Resolved>>,
    ready: Vec<Resolved>,
    /// Hashes that are in flight or ready.
    hashes: HashSet<String>,
}

impl Fetches {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            inflight: FuturesUnordered::new(),
            ready: Vec::new(),
            hashes: HashSet::new(),
        }
    }

    /// Starts fetching content in the background, unless it is already being
    /// fetched.
    pub fn spawn(&mut self, hash: String) {
        if !self.hashes.insert(hash.clone()) {
            return;
        }
        tracing::debug!(%hash, "fetching content");
        let handle = tokio::spawn(self.resolver.fetch(&hash));
        self.inflight.push(
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(anyhow::Error::from(err).context("content fetch panicked")),
                };
                Resolved { hash, result }
            }
            .boxed(),
        );
    }

    /// Takes all fetches that completed so far without waiting.
    pub fn take_ready(&mut self) -> Vec<Resolved> {
        while let Some(Some(resolved)) = self.inflight.next().now_or_never() {
            self.ready.push(resolved);
        }
        let ready = std::mem::take(&mut self.ready);
        for resolved in &ready {
            self.hashes.remove(&resolved.hash);
        }
        ready
    }

    /// Puts back fetches that were taken but not processed.
    pub fn restore(&mut self, mut resolved: Vec<Resolved>) {
        self.hashes
            .extend(resolved.iter().map(|resolved| resolved.hash.clone()));
        resolved.append(&mut self.ready);
        self.ready = resolved;
    }

    /// Waits for all in-flight fetches to complete.
    pub async fn settle(&mut self) {
        while let Some(resolved) = self.inflight.next().await {
            self.ready.push(resolved);
        }
    }

    pub fn pending(&self) -> usize {
        self.inflight.len() + self.ready.len()
    }
}
