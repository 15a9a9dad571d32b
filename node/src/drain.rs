//! Stopping a listener together with the connections it accepted
//!
//! Every connection task holds a [`ConnectionGuard`]. [`Drain::trigger`]
//! tells all of them to wind down; [`Drain::drained`] resolves once the last
//! guard has been dropped.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub struct Drain {
    stop: watch::Sender<bool>,
    done_tx: Mutex<Option<mpsc::Sender<()>>>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

/// Held by one connection task for its whole lifetime
pub struct ConnectionGuard {
    stop: watch::Receiver<bool>,
    _done: mpsc::Sender<()>,
}

impl ConnectionGuard {
    /// Resolves once the owning listener is stopping
    pub async fn stopped(&mut self) {
        while !*self.stop.borrow_and_update() {
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drain {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(1);
        Self {
            stop,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: tokio::sync::Mutex::new(done_rx),
        }
    }

    /// `None` once the drain has been triggered
    pub fn guard(&self) -> Option<ConnectionGuard> {
        let done = self.done_tx.lock().ok()?.clone()?;
        Some(ConnectionGuard {
            stop: self.stop.subscribe(),
            _done: done,
        })
    }

    pub fn trigger(&self) {
        self.stop.send_replace(true);
        if let Ok(mut done) = self.done_tx.lock() {
            done.take();
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.stop.borrow()
    }

    /// Waits up to `timeout` for every guard to be dropped; returns whether
    /// all of them were
    pub async fn drained(&self, timeout: Duration) -> bool {
        let mut done = self.done_rx.lock().await;
        tokio::time::timeout(timeout, async {
            while done.recv().await.is_some() {}
        })
        .await
        .is_ok()
    }
}
