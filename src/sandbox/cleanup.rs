//! Teardown registry.
//!
//! Every construction step that acquires a resource registers its undo here
//! *before* the next fallible call, so at any failure point the registry is
//! a faithful inverse of completed work. [`Cleanup::run`] executes priority
//! entries first (insertion order), then normal entries in reverse
//! insertion order — the last resource acquired is the first released.
//! Errors are collected and joined, never swallowed, and a second run is a
//! no-op success.
//!
//! Priority entries exist because a hung hypervisor keeps file descriptors
//! open and pins block devices; it must be forced down before file removal
//! and device release run.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::debug;

type CleanupFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;

struct Entry {
    label: &'static str,
    action: CleanupAction,
}

#[derive(Default)]
struct Registry {
    priority: Vec<Entry>,
    normal: Vec<Entry>,
    drained: bool,
}

/// Shared handle to a sandbox's teardown registry.
///
/// Clones share the same registry; the sandbox keeps one for `stop` while
/// the constructor's caller keeps one for the failure path.
#[derive(Clone, Default)]
pub struct Cleanup {
    registry: Arc<Mutex<Registry>>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a normal entry. Normal entries run after all priority
    /// entries, in reverse insertion order. Actions must be idempotent.
    pub fn add<F, Fut>(&self, label: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(label, action, false);
    }

    /// Registers a priority entry. Priority entries run first, in insertion
    /// order.
    pub fn add_priority<F, Fut>(&self, label: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(label, action, true);
    }

    fn push<F, Fut>(&self, label: &'static str, action: F, priority: bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let entry = Entry {
            label,
            action: Box::new(move || Box::pin(action()) as CleanupFuture),
        };
        let mut registry = self.registry.lock().expect("cleanup registry lock poisoned");
        if registry.drained {
            debug!(label, "cleanup already drained, dropping late registration");
            return;
        }
        if priority {
            registry.priority.push(entry);
        } else {
            registry.normal.push(entry);
        }
    }

    /// Runs every registered entry at most once and returns the joined
    /// error. A second call returns `Ok(())` without doing anything.
    pub async fn run(&self) -> Result<()> {
        let (priority, normal) = {
            let mut registry = self.registry.lock().expect("cleanup registry lock poisoned");
            if registry.drained {
                return Ok(());
            }
            registry.drained = true;
            (
                std::mem::take(&mut registry.priority),
                std::mem::take(&mut registry.normal),
            )
        };

        let mut errors: Vec<anyhow::Error> = Vec::new();
        for entry in priority.into_iter().chain(normal.into_iter().rev()) {
            debug!(label = entry.label, "running cleanup entry");
            if let Err(e) = (entry.action)().await {
                errors.push(e.context(entry.label));
            }
        }

        join_errors(errors)
    }

    /// Whether `run` has already executed.
    pub fn is_drained(&self) -> bool {
        self.registry
            .lock()
            .expect("cleanup registry lock poisoned")
            .drained
    }
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock().expect("cleanup registry lock poisoned");
        f.debug_struct("Cleanup")
            .field("priority", &registry.priority.len())
            .field("normal", &registry.normal.len())
            .field("drained", &registry.drained)
            .finish()
    }
}

/// Joins a batch of errors into one, preserving each message.
pub(crate) fn join_errors(mut errors: Vec<anyhow::Error>) -> Result<()> {
    match errors.pop() {
        None => Ok(()),
        Some(only) if errors.is_empty() => Err(only),
        Some(last) => {
            errors.push(last);
            let joined = errors
                .iter()
                .map(|e| format!("{e:#}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(anyhow!(joined))
        }
    }
}
