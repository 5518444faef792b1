//! A feed reading from an Ethereum JSON RPC node.
//!
//! The feed works in two modes:
//! - Catching up: blocks up to the finalized block can't be reorged, so logs
//!   are fetched in pages of block ranges with `eth_getLogs`. Only blocks
//!   that contain logs (plus the last block of every page, so that progress is
//!   recorded) are emitted.
//! - Following: once the finalized block is reached, blocks are fetched one by
//!   one and a local [`Chain`] of unfinalized block hashes is used to detect
//!   reorgs.

use super::{
    chain::{self, Chain},
    Block, Feed, Update,
};
use crate::trigger::{BlockPtr, RawLog};
use anyhow::{Context, Result};
use ethrpc::{
    eth,
    types::{ArrayVec, BlockTag, Hydrated, LogBlocks, LogFilter, LogFilterValue},
};
use futures::{future::BoxFuture, FutureExt};
use solabi::ethprim::{Address, Digest, U256};
use std::{
    cmp,
    collections::{BTreeMap, VecDeque},
};

pub struct Rpc {
    eth: ethrpc::http::Client,
    addresses: Vec<Address>,
    page_size: u64,
    /// The next block to fetch while catching up.
    next: u64,
    buffer: VecDeque<Block>,
    /// Local chain state, once following.
    chain: Option<Chain>,
}

impl Rpc {
    /// Creates a new RPC feed that starts at block `start`. The page size is
    /// the number of blocks to fetch logs for at once while catching up. Using
    /// larger values will speed up initialization, but may cause issues if too
    /// many events are fetched per page.
    pub fn new(eth: ethrpc::http::Client, start: u64, page_size: u64) -> Self {
        Self {
            eth,
            addresses: Vec::new(),
            page_size: cmp::max(page_size, 1),
            next: start,
            buffer: VecDeque::new(),
            chain: None,
        }
    }

    async fn update(&mut self) -> Result<Option<Update>> {
        if let Some(block) = self.buffer.pop_front() {
            return Ok(Some(Update::Block(block)));
        }
        if self.chain.is_none() {
            let finalized = self.finalized().await?;
            if self.next <= finalized {
                self.page(finalized).await?;
                return Ok(self.buffer.pop_front().map(Update::Block));
            }

            let parent = self.next.saturating_sub(1);
            let block = self
                .eth
                .execute(
                    eth::GetBlockByNumber,
                    (U256::from(parent).into(), Hydrated::No),
                )
                .await?
                .with_context(|| format!("missing block {parent}"))?;
            tracing::info!(block = %parent, "caught up to finalized block");
            self.chain = Some(Chain::new(parent, block.hash));
        }
        self.follow().await
    }

    async fn finalized(&self) -> Result<u64> {
        let block = self
            .eth
            .execute(
                eth::GetBlockByNumber,
                (BlockTag::Finalized.into(), Hydrated::No),
            )
            .await?
            .context("missing finalized block")?;
        Ok(block.number.as_u64())
    }

    /// Fetches a page of historic logs into the buffer.
    async fn page(&mut self, finalized: u64) -> Result<()> {
        let from = self.next;
        let to = cmp::min(finalized, from + self.page_size - 1);
        tracing::debug!(%from, %to, "fetching historic logs");

        let results = if self.addresses.is_empty() {
            Vec::new()
        } else {
            self.eth
                .batch(
                    self.addresses
                        .iter()
                        .map(|address| {
                            (
                                eth::GetLogs,
                                (filter(
                                    *address,
                                    LogBlocks::Range {
                                        from: from.into(),
                                        to: to.into(),
                                    },
                                ),),
                            )
                        })
                        .collect::<Vec<_>>(),
                )
                .await?
        };

        let mut blocks = BTreeMap::<u64, Vec<RawLog>>::new();
        for log in results.into_iter().flatten() {
            let log = raw_log(log);
            blocks.entry(log.block_number).or_default().push(log);
        }
        blocks.entry(to).or_default();

        let headers = self
            .eth
            .batch(
                blocks
                    .keys()
                    .map(|number| {
                        (
                            eth::GetBlockByNumber,
                            (U256::from(*number).into(), Hydrated::No),
                        )
                    })
                    .collect::<Vec<_>>(),
            )
            .await?;
        for (header, (number, logs)) in headers.into_iter().zip(blocks) {
            let header = header.with_context(|| format!("missing block {number}"))?;
            self.buffer.push_back(Block {
                number,
                hash: header.hash,
                parent_hash: header.parent_hash,
                timestamp: header.timestamp.as_u64(),
                logs,
            });
        }

        self.next = to + 1;
        Ok(())
    }

    async fn follow(&mut self) -> Result<Option<Update>> {
        let Self {
            eth,
            addresses,
            chain,
            ..
        } = self;
        let chain = chain.as_mut().context("not following the chain")?;

        let next = match eth
            .execute(
                eth::GetBlockByNumber,
                (U256::from(chain.next()).into(), Hydrated::No),
            )
            .await?
        {
            Some(value) => value,
            None => return Ok(None),
        };
        let number = next.number.as_u64();

        match chain.append(next.hash, next.parent_hash)? {
            chain::Append::Ok => {
                tracing::debug!(block = %number, hash = %next.hash, "found new block");
            }
            chain::Append::Reorg => {
                let fork = number - 1;
                tracing::debug!(block = %fork, hash = %next.parent_hash, "reorg");
                return Ok(Some(Update::Reorg { fork, head: number }));
            }
        }

        let (finalized, results) = tokio::try_join!(
            async {
                eth.execute(
                    eth::GetBlockByNumber,
                    (BlockTag::Finalized.into(), Hydrated::No),
                )
                .await?
                .context("missing finalized block")
            },
            async {
                if addresses.is_empty() {
                    return Ok(Vec::new());
                }
                eth.batch(
                    addresses
                        .iter()
                        .map(|address| {
                            (
                                eth::GetLogs,
                                (filter(*address, LogBlocks::Hash(next.hash)),),
                            )
                        })
                        .collect::<Vec<_>>(),
                )
                .await
                .map_err(anyhow::Error::from)
            },
        )?;

        let finalized = finalized.number.as_u64();
        if chain.finalize(finalized)? != finalized {
            tracing::debug!(block = %finalized, "updated finalized block");
        }

        let mut logs = results
            .into_iter()
            .flatten()
            .map(raw_log)
            .collect::<Vec<_>>();
        logs.sort_by_key(RawLog::position);

        Ok(Some(Update::Block(Block {
            number,
            hash: next.hash,
            parent_hash: next.parent_hash,
            timestamp: next.timestamp.as_u64(),
            logs,
        })))
    }

    async fn hash(&self, number: u64) -> Result<Option<Digest>> {
        let block = self
            .eth
            .execute(
                eth::GetBlockByNumber,
                (U256::from(number).into(), Hydrated::No),
            )
            .await?;
        Ok(block.map(|block| block.hash))
    }

    async fn add(&mut self, address: Address, block: Option<BlockPtr>) -> Result<Vec<RawLog>> {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
        let Some(block) = block else {
            return Ok(Vec::new());
        };

        // Buffered blocks were fetched without the new address.
        if self.chain.is_none() && !self.buffer.is_empty() {
            tracing::debug!(%block, "discarding buffered blocks for new address");
            self.buffer.clear();
            self.next = block.number + 1;
        }

        let logs = self
            .eth
            .execute(eth::GetLogs, (filter(address, LogBlocks::Hash(block.hash)),))
            .await?;
        Ok(logs.into_iter().map(raw_log).collect())
    }
}

impl Feed for Rpc {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Update>>> {
        self.update().boxed()
    }

    fn watch(
        &mut self,
        address: Address,
        block: Option<BlockPtr>,
    ) -> BoxFuture<'_, Result<Vec<RawLog>>> {
        self.add(address, block).boxed()
    }

    fn canonical(&mut self, number: u64) -> BoxFuture<'_, Result<Option<Digest>>> {
        self.hash(number).boxed()
    }

    fn resume(&mut self, head: BlockPtr) {
        tracing::debug!(block = %head.number, "resuming after indexed block");
        self.next = head.number + 1;
        self.buffer.clear();
        self.chain = None;
    }
}

fn filter(address: Address, blocks: LogBlocks) -> LogFilter {
    LogFilter {
        address: LogFilterValue::Exact(address),
        topics: ArrayVec::new(),
        blocks,
    }
}

fn raw_log(log: ethrpc::types::Log) -> RawLog {
    RawLog {
        address: log.address,
        topics: log.topics.to_vec(),
        data: log.data,
        block_number: log.block_number.as_u64(),
        transaction_hash: log.transaction_hash,
        transaction_index: log.transaction_index.as_u64(),
        log_index: log.log_index.as_u64(),
    }
}
