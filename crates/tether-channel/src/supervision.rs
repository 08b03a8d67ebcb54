//! Supervision — fault propagation across a channel composition.
//!
//! Every layer of a composition (blob pipe, object pipe, RPC channel)
//! registers with one [`Supervisor`]. Events come in three severities:
//!
//!   warning      logged, nothing else happens
//!   termination  graceful shutdown of every component, once
//!   fatal        logged as an error, then the same teardown, synchronously
//!
//! Teardown happens exactly once however many events race to trigger it.
//! A `fatal` that loses the race waits for the winner to finish. Components
//! may already be stopped when they are told to shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tokio::sync::watch;

use crate::lock;

/// Something a supervisor can tear down.
pub trait Component: Send + Sync {
    fn name(&self) -> String;

    /// Stop. Must tolerate being called on an already-stopped component.
    fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Running,
    /// Shutting components down on the given thread.
    TearingDown(ThreadId),
    Done,
}

pub struct Supervisor {
    name: String,
    terminated: AtomicBool,
    stage: Mutex<Stage>,
    finished: Condvar,
    components: Mutex<Vec<Weak<dyn Component>>>,
    signal: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (signal, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            terminated: AtomicBool::new(false),
            stage: Mutex::new(Stage::Running),
            finished: Condvar::new(),
            components: Mutex::new(Vec::new()),
            signal,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a component to the teardown list. Registering after termination
    /// shuts the component down immediately.
    pub fn register(&self, component: Weak<dyn Component>) {
        {
            let mut components = lock(&self.components);
            if !self.terminated.load(Ordering::SeqCst) {
                components.push(component);
                return;
            }
        }
        if let Some(component) = component.upgrade() {
            component.shutdown();
        }
    }

    pub fn warning(&self, source: &str, message: &str) {
        tracing::warn!(supervisor = %self.name, source, "{message}");
    }

    /// Graceful end of the composition.
    pub fn terminate(&self, source: &str, reason: &str) {
        if self.is_terminated() {
            return;
        }
        tracing::info!(supervisor = %self.name, source, reason, "terminating");
        self.teardown();
    }

    /// Unrecoverable failure. Every component is shut down before this returns.
    pub fn fatal(&self, source: &str, error: &str) {
        tracing::error!(supervisor = %self.name, source, error, "fatal error");
        self.teardown();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once the composition has been torn down.
    pub async fn terminated(&self) {
        let mut rx = self.signal.subscribe();
        // An error means the sender is gone, which only happens with self.
        let _ = rx.wait_for(|done| *done).await;
    }

    fn teardown(&self) {
        let me = thread::current().id();
        {
            let mut stage = lock(&self.stage);
            let current = *stage;
            match current {
                Stage::Running => *stage = Stage::TearingDown(me),
                // Re-entered from a component's shutdown.
                Stage::TearingDown(owner) if owner == me => return,
                Stage::TearingDown(_) => {
                    let _done = self
                        .finished
                        .wait_while(stage, |s| matches!(s, Stage::TearingDown(_)))
                        .unwrap_or_else(PoisonError::into_inner);
                    return;
                }
                Stage::Done => return,
            }
        }

        let components = {
            let mut components = lock(&self.components);
            self.terminated.store(true, Ordering::SeqCst);
            std::mem::take(&mut *components)
        };
        for component in components.iter().filter_map(Weak::upgrade) {
            tracing::debug!(supervisor = %self.name, component = %component.name(), "shutting down");
            component.shutdown();
        }

        *lock(&self.stage) = Stage::Done;
        self.finished.notify_all();
        self.signal.send_replace(true);
    }
}
