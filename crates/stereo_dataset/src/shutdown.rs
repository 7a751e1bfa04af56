//! Pipeline-wide cancellation.
//!
//! A [`ShutdownSignal`] is cloned into every producer and the consumer. Every
//! blocking point selects on [`ShutdownSignal::receiver`] next to its data
//! channel: triggering drops the only sender, so all pending and future
//! receives on it complete at once.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            sender: Arc::new(Mutex::new(Some(tx))),
            receiver: rx,
        }
    }

    /// Idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let taken = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(taken);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the signal fires; never yields a value.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}
