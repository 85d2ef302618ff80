use crate::message::{GetBlocksMessage, InventoryType};
use crate::task::{PeerTask, TaskContext, TaskMessage, TaskOutcome};
use crate::Message;
use spv_consensus::params::MAX_BLOCKS_PER_INV;
use spv_consensus::Hash256;
use std::time::Duration;

const MIN_EXPECTED_HASHES: usize = 6;
const MAX_IDLE_TIME: Duration = Duration::from_secs(10);
const MIN_IDLE_TIME: Duration = Duration::from_secs(1);

/// Sends `getblocks` and collects the announced block hashes.
///
/// A peer answering `getblocks` may also announce its own tip in a separate
/// `inv`. When that tip is one of our locator hashes the message is
/// swallowed so it does not replace the real batch.
#[derive(Debug)]
pub struct GetBlockHashesTask {
    locator: Vec<Hash256>,
    expected: usize,
    idle_time: Duration,
    block_hashes: Vec<Hash256>,
}

impl GetBlockHashesTask {
    pub fn new(locator: Vec<Hash256>, expected_min_count: usize) -> Self {
        let expected = expected_min_count.clamp(MIN_EXPECTED_HASHES, MAX_BLOCKS_PER_INV);
        let scaled = MAX_IDLE_TIME.mul_f64(expected as f64 / MAX_BLOCKS_PER_INV as f64);

        Self {
            locator,
            expected,
            idle_time: scaled.max(MIN_IDLE_TIME),
            block_hashes: Vec::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}

impl PeerTask for GetBlockHashesTask {
    fn name(&self) -> &'static str {
        "get-block-hashes"
    }

    fn start(&mut self, ctx: &mut TaskContext) {
        ctx.send(Message::GetBlocks(GetBlocksMessage {
            version: ctx.protocol_version() as u32,
            locator: self.locator.clone(),
            stop_hash: Hash256::ZERO,
        }));
        ctx.reset_timer();
    }

    fn handle_message(&mut self, message: &TaskMessage, ctx: &mut TaskContext) -> bool {
        let TaskMessage::Inventory(items) = message else {
            return false;
        };

        let hashes: Vec<Hash256> = items
            .iter()
            .filter(|item| item.kind == InventoryType::Block)
            .map(|item| item.hash)
            .collect();
        if hashes.is_empty() {
            return false;
        }

        if hashes.iter().any(|hash| self.locator.contains(hash)) {
            return true;
        }

        if hashes.len() >= self.expected {
            ctx.complete();
        }
        if hashes.len() > self.block_hashes.len() {
            self.block_hashes = hashes;
        }

        true
    }

    fn handle_timeout(&mut self, ctx: &mut TaskContext) {
        ctx.complete();
    }

    fn allowed_idle_time(&self) -> Duration {
        self.idle_time
    }

    fn into_outcome(self: Box<Self>) -> TaskOutcome {
        TaskOutcome::BlockHashes(self.block_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InventoryItem;
    use crate::task::TaskState;
    use spv_consensus::sha256d;

    fn hashes(range: std::ops::Range<u32>) -> Vec<Hash256> {
        range.map(|i| sha256d(&i.to_le_bytes())).collect()
    }

    fn inv(hashes: &[Hash256], kind: InventoryType) -> TaskMessage {
        TaskMessage::Inventory(hashes.iter().map(|h| InventoryItem::new(kind, *h)).collect())
    }

    #[test]
    fn test_expected_count_and_idle_time() {
        let small = GetBlockHashesTask::new(vec![], 0);
        assert_eq!(small.expected(), 6);
        assert_eq!(small.allowed_idle_time(), Duration::from_secs(1));

        let large = GetBlockHashesTask::new(vec![], 10_000);
        assert_eq!(large.expected(), 500);
        assert_eq!(large.allowed_idle_time(), Duration::from_secs(10));

        let mid = GetBlockHashesTask::new(vec![], 250);
        assert_eq!(mid.allowed_idle_time(), Duration::from_secs(5));
    }

    #[test]
    fn test_start_sends_getblocks() {
        let locator = hashes(0..3);
        let mut task = GetBlockHashesTask::new(locator.clone(), 100);
        let mut ctx = TaskContext::new(70014);
        task.start(&mut ctx);

        match ctx.outbox() {
            [Message::GetBlocks(m)] => {
                assert_eq!(m.version, 70014);
                assert_eq!(m.locator, locator);
                assert_eq!(m.stop_hash, Hash256::ZERO);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_completes_when_expected_count_reached() {
        let mut task = GetBlockHashesTask::new(hashes(1000..1001), 10);
        let batch = hashes(0..10);

        let mut ctx = TaskContext::new(70014);
        assert!(task.handle_message(&inv(&batch, InventoryType::Block), &mut ctx));
        assert_eq!(ctx.state(), &TaskState::Completed);
        assert_eq!(Box::new(task).into_outcome(), TaskOutcome::BlockHashes(batch));
    }

    #[test]
    fn test_keeps_largest_batch_until_timeout() {
        let mut task = GetBlockHashesTask::new(hashes(1000..1001), 100);
        let mut ctx = TaskContext::new(70014);

        assert!(task.handle_message(&inv(&hashes(0..5), InventoryType::Block), &mut ctx));
        assert!(task.handle_message(&inv(&hashes(0..2), InventoryType::Block), &mut ctx));
        assert_eq!(ctx.state(), &TaskState::Running);

        task.handle_timeout(&mut ctx);
        assert_eq!(ctx.state(), &TaskState::Completed);
        assert_eq!(
            Box::new(task).into_outcome(),
            TaskOutcome::BlockHashes(hashes(0..5))
        );
    }

    #[test]
    fn test_locator_echo_is_swallowed() {
        let locator = hashes(0..2);
        let mut task = GetBlockHashesTask::new(locator.clone(), 6);
        let mut ctx = TaskContext::new(70014);

        assert!(task.handle_message(&inv(&locator[..1], InventoryType::Block), &mut ctx));
        task.handle_timeout(&mut ctx);
        assert_eq!(Box::new(task).into_outcome(), TaskOutcome::BlockHashes(vec![]));
    }

    #[test]
    fn test_transaction_inventory_not_consumed() {
        let mut task = GetBlockHashesTask::new(vec![], 6);
        let mut ctx = TaskContext::new(70014);
        assert!(!task.handle_message(&inv(&hashes(0..3), InventoryType::Tx), &mut ctx));
        assert!(!task.handle_message(&TaskMessage::Other(Message::VerAck), &mut ctx));
    }
}
