//! A local representation of the blockchain. This keeps track of block hashes
//! past the finalized block and detects reorgs.

use anyhow::Result;
use solabi::ethprim::Digest;
use std::collections::VecDeque;

/// Local blockchain state.
#[derive(Clone, Debug)]
pub struct Chain {
    /// Hashes of the finalized block and all blocks after it, newest first.
    hashes: VecDeque<Digest>,
    finalized: u64,
}

impl Chain {
    /// Initializes a new local blockchain state from a known block's number
    /// and hash. That block is treated as final.
    pub fn new(finalized: u64, hash: Digest) -> Self {
        let mut hashes = VecDeque::new();
        hashes.push_front(hash);

        Self { hashes, finalized }
    }

    /// Returns the next block number in the chain.
    pub fn next(&self) -> u64 {
        self.finalized + self.hashes.len() as u64
    }

    /// Appends the next block in the chain to the local state.
    pub fn append(&mut self, hash: Digest, parent: Digest) -> Result<Append> {
        if parent != self.hashes[0] {
            anyhow::ensure!(self.hashes.len() > 1, "reorg past finalized block");

            self.hashes.pop_front();
            return Ok(Append::Reorg);
        }

        self.hashes.push_front(hash);
        Ok(Append::Ok)
    }

    /// Updates the finalized block. Returns the previous finalized block.
    /// Finalized blocks older than the current one are ignored.
    pub fn finalize(&mut self, finalized: u64) -> Result<u64> {
        anyhow::ensure!(finalized < self.next(), "invalid finalized block");
        let old = self.finalized;
        if finalized <= old {
            return Ok(old);
        }

        let keep = self.next() - finalized;
        self.finalized = finalized;
        self.hashes.truncate(keep as usize);

        Ok(old)
    }
}

/// The result of appending a new block to the local chain state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Append {
    Ok,
    Reorg,
}
