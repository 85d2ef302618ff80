//! Coarse sync status for callers.

use crate::listeners::BlockSyncListener;
use parking_lot::Mutex;
use spv_network::ListenerRegistry;
use std::fmt;
use std::sync::Arc;

/// User-facing sync state.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    NotSynced { error: Option<String> },
    Syncing { progress: f64 },
    Synced,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::NotSynced { error: Some(e) } => write!(f, "not synced ({})", e),
            SyncState::NotSynced { error: None } => write!(f, "not synced"),
            SyncState::Syncing { progress } => write!(f, "syncing {:.1}%", progress * 100.0),
            SyncState::Synced => write!(f, "synced"),
        }
    }
}

pub trait SyncStateListener: Send + Sync {
    fn on_sync_state_update(&self, state: &SyncState);
}

struct Inner {
    state: SyncState,
    initial_height: u32,
}

/// Folds block sync events into a [`SyncState`].
pub struct SyncStateTracker {
    inner: Mutex<Inner>,
    listeners: ListenerRegistry<dyn SyncStateListener>,
}

impl Default for SyncStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncState::NotSynced { error: None },
                initial_height: 0,
            }),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SyncStateListener>) {
        self.listeners.add(listener);
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state.clone()
    }

    fn set_state(&self, state: SyncState) {
        {
            let mut inner = self.inner.lock();
            if inner.state == state {
                return;
            }
            inner.state = state.clone();
        }
        self.listeners.notify(|l| l.on_sync_state_update(&state));
    }
}

impl BlockSyncListener for SyncStateTracker {
    fn on_sync_start(&self) {
        if self.state() != SyncState::Synced {
            self.set_state(SyncState::Syncing { progress: 0.0 });
        }
    }

    fn on_sync_stop(&self, error: Option<&str>) {
        self.set_state(SyncState::NotSynced {
            error: error.map(str::to_string),
        });
    }

    fn on_initial_best_block_height_update(&self, height: u32) {
        self.inner.lock().initial_height = height;
    }

    fn on_current_best_block_height_update(&self, height: u32, max_block_height: u32) {
        let initial = self.inner.lock().initial_height;
        let progress = if max_block_height <= initial {
            1.0
        } else {
            let done = height.saturating_sub(initial) as f64;
            (done / (max_block_height - initial) as f64).clamp(0.0, 1.0)
        };

        if progress >= 1.0 {
            self.set_state(SyncState::Synced);
        } else {
            self.set_state(SyncState::Syncing { progress });
        }
    }

    fn on_block_sync_finished(&self) {
        self.set_state(SyncState::Synced);
    }
}
