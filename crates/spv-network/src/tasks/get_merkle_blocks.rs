use crate::message::{InventoryItem, InventoryType};
use crate::task::{PeerTask, TaskContext, TaskMessage, TaskOutcome};
use crate::{Message, PeerError};
use spv_consensus::{BlockHash, MerkleBlock, HEADER_SIZE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const IDLE_TIME: Duration = Duration::from_secs(5);
const WARM_UP: Duration = Duration::from_secs(10);

/// Why a delivered merkle block was not taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleBlockRejection {
    /// Failed validation. The block is dropped and the peer kept.
    Invalid(String),
    /// Does not connect to the local chain yet. The block stays queued for
    /// a later iteration and the peer is kept.
    Unconnected(String),
    /// The peer cannot continue.
    Fatal(PeerError),
}

/// Receives merkle blocks once all their matched transactions arrived.
pub trait MerkleBlockHandler: Send + Sync {
    /// Only a [`MerkleBlockRejection::Fatal`] fails the task.
    fn handle_merkle_block(&self, block: MerkleBlock) -> Result<(), MerkleBlockRejection>;
}

/// Minimum per-minute download rates. A peer below all three is too slow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlowPeerThresholds {
    pub merkle_blocks: f64,
    pub transactions: f64,
    pub bytes: f64,
}

impl SlowPeerThresholds {
    /// Every threshold divided by `divisor`.
    pub fn relaxed(&self, divisor: f64) -> Self {
        Self {
            merkle_blocks: self.merkle_blocks / divisor,
            transactions: self.transactions / divisor,
            bytes: self.bytes / divisor,
        }
    }
}

impl Default for SlowPeerThresholds {
    fn default() -> Self {
        Self {
            merkle_blocks: 500.0,
            transactions: 50_000.0,
            bytes: 100_000.0,
        }
    }
}

#[derive(Debug, Default)]
struct Throughput {
    merkle_blocks: usize,
    transactions: usize,
    bytes: usize,
}

/// Requests filtered blocks and assembles them with their transactions.
pub struct GetMerkleBlocksTask {
    block_hashes: Vec<BlockHash>,
    pending: Vec<MerkleBlock>,
    handler: Arc<dyn MerkleBlockHandler>,
    thresholds: SlowPeerThresholds,
    received: Throughput,
    started_at: Instant,
    delivered: usize,
    deferred: usize,
}

impl GetMerkleBlocksTask {
    pub fn new(
        block_hashes: Vec<BlockHash>,
        handler: Arc<dyn MerkleBlockHandler>,
        thresholds: SlowPeerThresholds,
    ) -> Self {
        Self {
            block_hashes,
            pending: Vec::new(),
            handler,
            thresholds,
            received: Throughput::default(),
            started_at: Instant::now(),
            delivered: 0,
            deferred: 0,
        }
    }

    fn handle_merkle_block(&mut self, block: &MerkleBlock, ctx: &mut TaskContext) -> bool {
        let Some(entry) = self
            .block_hashes
            .iter()
            .find(|entry| entry.header_hash == block.block_hash)
        else {
            return false;
        };

        ctx.reset_timer();
        self.received.merkle_blocks += 1;
        self.received.bytes += HEADER_SIZE + 32 * block.associated_transaction_hashes.len();

        let mut block = block.clone();
        block.height = (entry.height > 0).then_some(entry.height);

        if block.complete() {
            self.handle_completed(block, ctx);
        } else {
            self.pending.push(block);
        }
        true
    }

    fn handle_transaction(&mut self, tx: &spv_consensus::Transaction, ctx: &mut TaskContext) -> bool {
        let Some(index) = self
            .pending
            .iter()
            .position(|block| block.associated_transaction_hashes.contains(&tx.hash))
        else {
            return false;
        };

        ctx.reset_timer();
        self.received.transactions += 1;
        self.received.bytes += tx.raw.len();

        let block = &mut self.pending[index];
        if !block.associated_transactions.iter().any(|t| t.hash == tx.hash) {
            block.associated_transactions.push(tx.clone());
        }
        if block.complete() {
            let block = self.pending.remove(index);
            self.handle_completed(block, ctx);
        }
        true
    }

    fn handle_completed(&mut self, block: MerkleBlock, ctx: &mut TaskContext) {
        self.block_hashes
            .retain(|entry| entry.header_hash != block.block_hash);

        let hash = block.block_hash;
        match self.handler.handle_merkle_block(block) {
            Ok(()) => self.delivered += 1,
            Err(MerkleBlockRejection::Invalid(reason)) => {
                warn!(hash = %hash, reason, "Dropping invalid merkle block");
            }
            Err(MerkleBlockRejection::Unconnected(reason)) => {
                debug!(hash = %hash, reason, "Merkle block does not connect yet");
                self.deferred += 1;
            }
            Err(MerkleBlockRejection::Fatal(e)) => {
                ctx.fail(e);
                return;
            }
        }

        if self.block_hashes.is_empty() {
            ctx.complete();
        }
    }
}

impl PeerTask for GetMerkleBlocksTask {
    fn name(&self) -> &'static str {
        "get-merkle-blocks"
    }

    fn start(&mut self, ctx: &mut TaskContext) {
        if self.block_hashes.is_empty() {
            ctx.complete();
            return;
        }

        let items = self
            .block_hashes
            .iter()
            .map(|entry| InventoryItem::new(InventoryType::FilteredBlock, entry.header_hash))
            .collect();
        ctx.send(Message::GetData(items));
        ctx.reset_timer();
        self.started_at = Instant::now();
    }

    fn handle_message(&mut self, message: &TaskMessage, ctx: &mut TaskContext) -> bool {
        match message {
            TaskMessage::MerkleBlock(block) => self.handle_merkle_block(block, ctx),
            TaskMessage::Transaction(tx) => self.handle_transaction(tx, ctx),
            _ => false,
        }
    }

    fn handle_timeout(&mut self, ctx: &mut TaskContext) {
        if self.block_hashes.is_empty() {
            ctx.complete();
        } else {
            ctx.fail(PeerError::MerkleBlockNotReceived);
        }
    }

    fn on_tick(&mut self, now: Instant, ctx: &mut TaskContext) {
        let elapsed = now.saturating_duration_since(self.started_at);
        if elapsed < WARM_UP {
            return;
        }

        let per_minute = |count: usize| count as f64 * 60.0 / elapsed.as_secs_f64();
        let merkle_blocks = per_minute(self.received.merkle_blocks);
        let transactions = per_minute(self.received.transactions);
        let bytes = per_minute(self.received.bytes);

        if merkle_blocks < self.thresholds.merkle_blocks
            && transactions < self.thresholds.transactions
            && bytes < self.thresholds.bytes
        {
            debug!(
                merkle_blocks,
                transactions,
                bytes,
                "Download rate below minimum"
            );
            ctx.fail(PeerError::PeerTooSlow(format!(
                "{:.0} merkle blocks, {:.0} transactions, {:.0} bytes per minute",
                merkle_blocks, transactions, bytes
            )));
        }
    }

    fn allowed_idle_time(&self) -> Duration {
        IDLE_TIME
    }

    fn into_outcome(self: Box<Self>) -> TaskOutcome {
        TaskOutcome::MerkleBlocks {
            delivered: self.delivered,
            deferred: self.deferred,
        }
    }
}
