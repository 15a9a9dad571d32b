//! Process-wide trap for failures nobody awaits
//!
//! Background tasks are started through [`spawn_observed`]. A watcher awaits
//! each one and logs an error return or a panic, so nothing fails silently
//! and nothing brings the process down.

use log::{debug, error};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use tokio::task::{AbortHandle, JoinHandle};

static INSTALL: Once = Once::new();
static UNOBSERVED: AtomicU64 = AtomicU64::new(0);

/// Installs a panic hook that logs panics through `log`. Idempotent.
pub fn install_failure_trap() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic| {
            let location = panic
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown location".to_string());
            error!("Panic at {}: {}", location, panic_message(panic.payload()));
            if std::env::var_os("RUST_BACKTRACE").is_some() {
                previous(panic);
            }
        }));
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Failures trapped so far in this process
pub fn unobserved_failures() -> u64 {
    UNOBSERVED.load(Ordering::Relaxed)
}

/// A background task whose failure is logged instead of lost
#[derive(Debug)]
pub struct ObservedTask {
    abort: AbortHandle,
    watcher: JoinHandle<()>,
}

impl ObservedTask {
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished()
    }

    /// Waits until the task has ended and its outcome has been recorded
    pub async fn join(self) {
        let _ = self.watcher.await;
    }
}

pub fn spawn_observed<F, E>(name: impl Into<String>, task: F) -> ObservedTask
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let name = name.into();
    let handle = tokio::spawn(task);
    let abort = handle.abort_handle();

    let watcher = tokio::spawn(async move {
        match handle.await {
            Ok(Ok(())) => debug!("Task '{}' finished", name),
            Ok(Err(e)) => {
                UNOBSERVED.fetch_add(1, Ordering::Relaxed);
                error!("Task '{}' failed: {}", name, e);
            }
            Err(e) if e.is_cancelled() => debug!("Task '{}' cancelled", name),
            Err(e) => {
                UNOBSERVED.fetch_add(1, Ordering::Relaxed);
                error!("Task '{}' panicked: {}", name, panic_message(&*e.into_panic()));
            }
        }
    });

    ObservedTask { abort, watcher }
}
