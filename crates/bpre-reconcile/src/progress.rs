//! Shared done/total counter for a running batch, observable through a watch channel.

use std::sync::atomic::{AtomicUsize, Ordering};

use bpre_core::ProgressState;
use tokio::sync::watch;

/// Done/total counter fed by batch settlements. `done` only ever grows and
/// `total` is fixed at construction.
#[derive(Debug)]
pub struct ProgressTracker {
    done: AtomicUsize,
    total: usize,
    tx: watch::Sender<ProgressState>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        let (tx, _rx) = watch::channel(ProgressState { done: 0, total });
        Self {
            done: AtomicUsize::new(0),
            total,
            tx,
        }
    }

    /// Count one settled result and publish the new state.
    pub fn record(&self) -> ProgressState {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let state = ProgressState {
            done,
            total: self.total,
        };
        self.tx.send_if_modified(|current| {
            if state.done > current.done {
                *current = state;
                true
            } else {
                false
            }
        });
        state
    }

    pub fn state(&self) -> ProgressState {
        ProgressState {
            done: self.done.load(Ordering::SeqCst),
            total: self.total,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.tx.subscribe()
    }
}
