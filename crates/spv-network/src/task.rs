//! Per-peer request/response tasks.
//!
//! A [`PeerTask`] is one exchange with a peer, such as "fetch these merkle
//! blocks". Tasks never touch the connection directly. They report through
//! a [`TaskContext`], and the owning [`TaskQueue`] turns that into
//! [`QueueEvent`]s for the connection loop.
//!
//! The queue is strictly FIFO: inbound messages are offered to tasks in
//! order, only the head task is checked for timeouts, and the peer becomes
//! ready again once the queue drains.

use crate::{Message, PeerError};
use spv_consensus::{Hash256, MerkleBlock, Transaction};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// An inbound message offered to tasks.
#[derive(Debug, Clone)]
pub enum TaskMessage {
    /// Extracted and verified merkle block.
    MerkleBlock(MerkleBlock),
    /// Relayed transaction.
    Transaction(Transaction),
    /// Inventory announcement.
    Inventory(Vec<crate::InventoryItem>),
    /// Anything else.
    Other(Message),
}

/// Task lifecycle state as reported through the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Failed(PeerError),
}

/// Collects what a task wants done after one callback.
#[derive(Debug)]
pub struct TaskContext {
    outbox: Vec<Message>,
    state: TaskState,
    reset_timer: bool,
    protocol_version: i32,
}

impl TaskContext {
    pub fn new(protocol_version: i32) -> Self {
        Self {
            outbox: Vec::new(),
            state: TaskState::Running,
            reset_timer: false,
            protocol_version,
        }
    }

    /// Queue a message to the peer.
    pub fn send(&mut self, message: Message) {
        self.outbox.push(message);
    }

    /// Mark the task done.
    pub fn complete(&mut self) {
        if self.state == TaskState::Running {
            self.state = TaskState::Completed;
        }
    }

    /// Mark the task failed; the peer is closed with `error`.
    pub fn fail(&mut self, error: PeerError) {
        if self.state == TaskState::Running {
            self.state = TaskState::Failed(error);
        }
    }

    /// Restart the task's idle clock.
    pub fn reset_timer(&mut self) {
        self.reset_timer = true;
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn outbox(&self) -> &[Message] {
        &self.outbox
    }
}

/// Result handed to the sync layer when a task completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Block hashes announced in reply to `getblocks`. Empty means the peer
    /// has nothing beyond our locator.
    BlockHashes(Vec<Hash256>),
    /// Every requested merkle block arrived. `deferred` of them did not
    /// connect to the local chain and stay queued.
    MerkleBlocks { delivered: usize, deferred: usize },
}

/// One request/response exchange owned by a single peer.
pub trait PeerTask: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Called once when the task is queued.
    fn start(&mut self, ctx: &mut TaskContext);

    /// Offer an inbound message. Returns `true` when consumed.
    fn handle_message(&mut self, message: &TaskMessage, ctx: &mut TaskContext) -> bool;

    /// Head task has been idle longer than [`PeerTask::allowed_idle_time`].
    fn handle_timeout(&mut self, ctx: &mut TaskContext);

    /// Periodic hook for the head task.
    fn on_tick(&mut self, _now: Instant, _ctx: &mut TaskContext) {}

    /// Idle time tolerated before [`PeerTask::handle_timeout`].
    fn allowed_idle_time(&self) -> Duration;

    /// Consume the finished task.
    fn into_outcome(self: Box<Self>) -> TaskOutcome;
}

/// What the connection loop must do after a queue operation.
pub enum QueueEvent {
    /// Write a message to the peer.
    Send(Message),
    /// A task finished.
    Completed(Box<dyn PeerTask>),
    /// A task failed; close the peer.
    Failed(PeerError),
    /// The queue drained.
    Ready,
}

impl std::fmt::Debug for QueueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueEvent::Send(message) => write!(f, "Send({})", message.command()),
            QueueEvent::Completed(task) => write!(f, "Completed({})", task.name()),
            QueueEvent::Failed(error) => write!(f, "Failed({})", error),
            QueueEvent::Ready => write!(f, "Ready"),
        }
    }
}

struct Entry {
    task: Box<dyn PeerTask>,
    last_active: Instant,
}

/// FIFO of tasks for one peer.
pub struct TaskQueue {
    entries: VecDeque<Entry>,
    protocol_version: i32,
}

impl TaskQueue {
    pub fn new(protocol_version: i32) -> Self {
        Self {
            entries: VecDeque::new(),
            protocol_version,
        }
    }

    /// Negotiated protocol version, passed to tasks.
    pub fn set_protocol_version(&mut self, protocol_version: i32) {
        self.protocol_version = protocol_version;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every task without notifying anyone.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Queue and start a task.
    pub fn push(&mut self, mut task: Box<dyn PeerTask>, now: Instant) -> Vec<QueueEvent> {
        let mut ctx = TaskContext::new(self.protocol_version);
        task.start(&mut ctx);
        self.entries.push_back(Entry {
            task,
            last_active: now,
        });
        let index = self.entries.len() - 1;
        self.settle(index, ctx, now)
    }

    /// Offer a message to the tasks in order. The first that consumes it
    /// wins.
    pub fn dispatch(&mut self, message: &TaskMessage, now: Instant) -> (bool, Vec<QueueEvent>) {
        for index in 0..self.entries.len() {
            let mut ctx = TaskContext::new(self.protocol_version);
            if self.entries[index].task.handle_message(message, &mut ctx) {
                return (true, self.settle(index, ctx, now));
            }
        }
        (false, Vec::new())
    }

    /// Run the head task's tick and idle check.
    pub fn check_timeout(&mut self, now: Instant) -> Vec<QueueEvent> {
        let Some(head) = self.entries.front_mut() else {
            return Vec::new();
        };

        let mut ctx = TaskContext::new(self.protocol_version);
        head.task.on_tick(now, &mut ctx);
        if ctx.state == TaskState::Running
            && now.duration_since(head.last_active) > head.task.allowed_idle_time()
        {
            head.task.handle_timeout(&mut ctx);
        }
        self.settle(0, ctx, now)
    }

    fn settle(&mut self, index: usize, ctx: TaskContext, now: Instant) -> Vec<QueueEvent> {
        let TaskContext {
            outbox,
            state,
            reset_timer,
            ..
        } = ctx;

        let mut events: Vec<QueueEvent> = outbox.into_iter().map(QueueEvent::Send).collect();
        if reset_timer {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.last_active = now;
            }
        }

        match state {
            TaskState::Running => {}
            TaskState::Completed => {
                if let Some(entry) = self.entries.remove(index) {
                    events.push(QueueEvent::Completed(entry.task));
                }
                if let Some(head) = self.entries.front_mut() {
                    head.last_active = now;
                }
                if self.entries.is_empty() {
                    events.push(QueueEvent::Ready);
                }
            }
            TaskState::Failed(error) => {
                self.entries.remove(index);
                events.push(QueueEvent::Failed(error));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Completes when it sees a ping with its own nonce.
    struct EchoTask {
        nonce: u64,
        started: bool,
    }

    impl EchoTask {
        fn boxed(nonce: u64) -> Box<dyn PeerTask> {
            Box::new(Self {
                nonce,
                started: false,
            })
        }
    }

    impl PeerTask for EchoTask {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn start(&mut self, ctx: &mut TaskContext) {
            self.started = true;
            ctx.send(Message::Ping(self.nonce));
        }

        fn handle_message(&mut self, message: &TaskMessage, ctx: &mut TaskContext) -> bool {
            match message {
                TaskMessage::Other(Message::Pong(nonce)) if *nonce == self.nonce => {
                    ctx.complete();
                    true
                }
                _ => false,
            }
        }

        fn handle_timeout(&mut self, ctx: &mut TaskContext) {
            ctx.fail(PeerError::TaskFailed(format!("no pong {}", self.nonce)));
        }

        fn allowed_idle_time(&self) -> Duration {
            Duration::from_secs(5)
        }

        fn into_outcome(self: Box<Self>) -> TaskOutcome {
            TaskOutcome::MerkleBlocks {
                delivered: self.nonce as usize,
                deferred: 0,
            }
        }
    }

    fn pong(nonce: u64) -> TaskMessage {
        TaskMessage::Other(Message::Pong(nonce))
    }

    #[test]
    fn test_push_starts_task() {
        let mut queue = TaskQueue::new(70014);
        let events = queue.push(EchoTask::boxed(1), Instant::now());
        assert!(matches!(events.as_slice(), [QueueEvent::Send(Message::Ping(1))]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ordered_completions_then_one_ready() {
        let now = Instant::now();
        let mut queue = TaskQueue::new(70014);
        for nonce in 0..4 {
            queue.push(EchoTask::boxed(nonce), now);
        }

        let mut completed = Vec::new();
        let mut ready = 0;
        for nonce in 0..4 {
            let (consumed, events) = queue.dispatch(&pong(nonce), now);
            assert!(consumed);
            for event in events {
                match event {
                    QueueEvent::Completed(task) => completed.push(task.into_outcome()),
                    QueueEvent::Ready => {
                        assert_eq!(completed.len(), 4);
                        ready += 1;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }

        let expected: Vec<TaskOutcome> = (0..4)
            .map(|n| TaskOutcome::MerkleBlocks {
                delivered: n,
                deferred: 0,
            })
            .collect();
        assert_eq!(completed, expected);
        assert_eq!(ready, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unconsumed_message_is_returned() {
        let mut queue = TaskQueue::new(70014);
        queue.push(EchoTask::boxed(1), Instant::now());
        let (consumed, events) = queue.dispatch(&pong(9), Instant::now());
        assert!(!consumed);
        assert!(events.is_empty());
    }

    #[test]
    fn test_only_head_times_out() {
        let start = Instant::now();
        let mut queue = TaskQueue::new(70014);
        queue.push(EchoTask::boxed(1), start);
        queue.push(EchoTask::boxed(2), start);

        assert!(queue.check_timeout(start + Duration::from_secs(1)).is_empty());

        let events = queue.check_timeout(start + Duration::from_secs(6));
        assert_eq!(events.len(), 1);
        match &events[0] {
            QueueEvent::Failed(PeerError::TaskFailed(reason)) => assert_eq!(reason, "no pong 1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_next_head_timer_rearmed_on_completion() {
        let start = Instant::now();
        let mut queue = TaskQueue::new(70014);
        queue.push(EchoTask::boxed(1), start);
        queue.push(EchoTask::boxed(2), start);

        let later = start + Duration::from_secs(4);
        queue.dispatch(&pong(1), later);

        // Six seconds after the second task was queued but only two after it
        // became head.
        assert!(queue.check_timeout(start + Duration::from_secs(6)).is_empty());
        assert_eq!(queue.check_timeout(later + Duration::from_secs(6)).len(), 1);
    }

    #[test]
    fn test_empty_queue_timeout_is_noop() {
        let mut queue = TaskQueue::new(70014);
        assert!(queue.check_timeout(Instant::now()).is_empty());
    }
}
