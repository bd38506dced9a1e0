// Copyright (c) The vigil Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cleanup hooks that run when the watch loop shuts down.
//!
//! Collaborators register named hooks at startup; the dispatcher executes
//! them in reverse registration order once shutdown begins. All hooks share
//! a single deadline derived from the configured shutdown timeout, so a slow
//! hook eats into the time left for the ones after it.

use crate::errors::{BoxedError, ShutdownHookError};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, warn};

type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxedError>> + Send>;

struct Hook {
    name: String,
    action: HookFn,
}

/// What happened to one shutdown hook.
#[derive(Debug)]
pub struct HookOutcome {
    /// The name the hook was registered under.
    pub name: String,

    /// `Ok` if the hook completed within the deadline without an error.
    pub result: Result<(), ShutdownHookError>,
}

impl HookOutcome {
    /// Returns true if the hook completed cleanly.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// An ordered registry of shutdown hooks.
///
/// Handles are cheap to clone and share one underlying list, so subsystems
/// can register cleanup work as they start up. Hooks execute at most once:
/// execution drains the list.
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    inner: Arc<Mutex<Vec<Hook>>>,
}

impl ShutdownHooks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named hook.
    ///
    /// Hooks run in reverse registration order, mirroring how later
    /// subsystems depend on earlier ones.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxedError>> + Send + 'static,
    {
        let hook = Hook {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        };
        self.lock().push(hook);
    }

    /// The number of hooks currently registered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs every registered hook in reverse registration order, all racing
    /// one deadline of `timeout` from now.
    ///
    /// Each hook runs as its own task, so a panic is contained and reported
    /// rather than aborting the remaining hooks. A hook that misses the
    /// deadline is reported as timed out and abandoned; execution moves on
    /// without waiting for it. Every hook is polled at least once before the
    /// deadline is enforced, so cleanup that completes without waiting still
    /// runs even after the deadline has passed.
    pub(crate) async fn execute(&self, timeout: Duration) -> Vec<HookOutcome> {
        let hooks: Vec<Hook> = {
            let mut inner = self.lock();
            inner.drain(..).rev().collect()
        };
        if hooks.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(hooks.len());

        for Hook { name, action } in hooks {
            debug!(hook = %name, "running shutdown hook");
            let mut task = tokio::spawn(action());
            tokio::task::yield_now().await;

            let result = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(error))) => Err(ShutdownHookError::Failed {
                    name: name.clone(),
                    error,
                }),
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        Err(ShutdownHookError::Panicked {
                            name: name.clone(),
                            message: panic_payload_to_string(join_error.into_panic()),
                        })
                    } else {
                        Err(ShutdownHookError::Failed {
                            name: name.clone(),
                            error: Box::new(join_error),
                        })
                    }
                }
                Err(_) => {
                    task.abort();
                    Err(ShutdownHookError::TimedOut {
                        name: name.clone(),
                        timeout,
                    })
                }
            };

            if let Err(error) = &result {
                warn!(hook = %name, %error, "shutdown hook did not complete cleanly");
            }
            outcomes.push(HookOutcome { name, result });
        }

        outcomes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Hook>> {
        // Held only for list operations; a poisoned lock still hands back a
        // usable list.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("len", &self.len())
            .finish()
    }
}

/// Extracts a string message from a panic payload.
pub(crate) fn panic_payload_to_string(payload: Box<dyn std::any::Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(unknown panic payload)".to_owned()
    }
}
