//! # Error Supervisor
//!
//! ## Purpose
//!
//! Wraps the body of every thread a connection spawns. The supervisor runs
//! the body, catches an `Err` or a panic, records the first failure for the
//! stage and, whatever the outcome, closes the channel ends the thread owns
//! so that peers blocked in `pop()` wake up instead of deadlocking.
//!
//! ## Architecture Role
//!
//! ```text
//!  spawn(name, owned, body)
//!        │
//!        ▼
//!  ┌──────────────┐   Err / panic   ┌──────────────────────┐
//!  │ body()       │ ──────────────▶ │ record first error   │
//!  └──────────────┘                 │ run abort hooks once │
//!        │ exit (any)               └──────────────────────┘
//!        ▼
//!  owned.close()   ← always, via drop guard
//! ```
//!
//! Abort hooks registered with [`ErrorSupervisor::abort_on_error`] are closed
//! once, on the first recorded failure. Connections use this to shut down
//! the client socket's read side so an input thread parked in `read()` ends.

use crate::error::{StageError, StageResult};
use channel::Closeable;
use parking_lot::Mutex;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Scope, ScopedJoinHandle};
use tracing::{debug, error};

type AbortHook = Box<dyn Closeable + Send>;

#[derive(Default)]
struct State {
    failed: bool,
    first_error: Option<StageError>,
    abort_hooks: Vec<AbortHook>,
}

/// Shared failure recorder for one stage or strategy
#[derive(Clone, Default)]
pub struct ErrorSupervisor {
    state: Arc<Mutex<State>>,
}

/// Closes the owned closeable when the thread body exits, unwinding or not
struct CloseOnExit<C: Closeable>(C);

impl<C: Closeable> Drop for CloseOnExit<C> {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl ErrorSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close `hook` when the first failure is recorded (immediately if one already was)
    pub fn abort_on_error(&self, hook: impl Closeable + Send + 'static) {
        let mut state = self.state.lock();
        if state.failed {
            drop(state);
            hook.close();
        } else {
            state.abort_hooks.push(Box::new(hook));
        }
    }

    /// Record a failure; only the first one is kept
    pub fn record(&self, thread: &str, err: StageError) {
        let mut state = self.state.lock();
        if state.failed {
            drop(state);
            debug!(thread, error = %err, "Secondary failure ignored");
            return;
        }

        error!(thread, kind = err.kind(), error = %err, "Stage failed");
        state.failed = true;
        state.first_error = Some(err);
        let hooks = std::mem::take(&mut state.abort_hooks);
        drop(state);

        for hook in hooks {
            hook.close();
        }
    }

    pub fn has_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// First recorded failure, if any; consumes it
    pub fn take_error(&self) -> Option<StageError> {
        self.state.lock().first_error.take()
    }

    /// `Err` with the first recorded failure, else `Ok`
    pub fn result(&self) -> StageResult<()> {
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `body` in place under supervision
    pub fn run<C, F>(&self, name: &str, owned: C, body: F)
    where
        C: Closeable,
        F: FnOnce() -> StageResult<()>,
    {
        self.run_guarded(name, CloseOnExit(owned), body)
    }

    fn run_guarded<C, F>(&self, name: &str, _guard: CloseOnExit<C>, body: F)
    where
        C: Closeable,
        F: FnOnce() -> StageResult<()>,
    {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => debug!(thread = name, "Thread finished"),
            Ok(Err(err)) => self.record(name, err),
            Err(payload) => self.record(
                name,
                StageError::Panicked {
                    thread: name.to_string(),
                    message: panic_message(payload.as_ref()),
                },
            ),
        }
    }

    /// Spawn a detached supervised thread
    pub fn spawn<C, F>(&self, name: &str, owned: C, body: F) -> io::Result<JoinHandle<()>>
    where
        C: Closeable + Send + 'static,
        F: FnOnce() -> StageResult<()> + Send + 'static,
    {
        let supervisor = self.clone();
        let thread_name = name.to_string();
        // Guard created before spawning so a failed spawn still closes `owned`
        let guard = CloseOnExit(owned);
        thread::Builder::new().name(name.to_string()).spawn(move || {
            supervisor.run_guarded(&thread_name, guard, body)
        })
    }

    /// Spawn a supervised thread inside a `std::thread::scope`
    pub fn spawn_scoped<'scope, 'env, C, F>(
        &self,
        scope: &'scope Scope<'scope, 'env>,
        name: &str,
        owned: C,
        body: F,
    ) -> io::Result<ScopedJoinHandle<'scope, ()>>
    where
        C: Closeable + Send + 'scope,
        F: FnOnce() -> StageResult<()> + Send + 'scope,
    {
        let supervisor = self.clone();
        let thread_name = name.to_string();
        let guard = CloseOnExit(owned);
        thread::Builder::new()
            .name(name.to_string())
            .spawn_scoped(scope, move || {
                supervisor.run_guarded(&thread_name, guard, body)
            })
    }
}

impl std::fmt::Debug for ErrorSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSupervisor")
            .field("failed", &self.has_failed())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
