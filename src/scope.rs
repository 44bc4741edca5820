//! One-shot admission windows
//!
//! A [`Scope`] moves `Pending → Started → Ended` exactly once. Callers wait on
//! its start signal before touching the engine; the scheduler chains scopes
//! together through their end signal.
//!
//! A scope ended while still pending stops admitting new waiters right away,
//! but its end signal only fires once it has also been started. A window that
//! never opened cannot hand its turn to the next one early.

use crate::error::{SqliteError, SqliteResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn, Instrument};

/// Interval of the advisory warning for scopes that stay open
pub const DEFAULT_WARNING_INTERVAL: Duration = Duration::from_secs(10);

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

type EndHook = Box<dyn FnOnce() + Send>;

/// What a scope admits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Shared window for operations issued without an explicit scope
    Community,
    /// Dedicated window bounding a transaction
    User,
}

/// Observable lifecycle of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Pending,
    Started,
    Ended,
}

#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    started: bool,
    ended: bool,
}

impl Signals {
    fn end_signaled(&self) -> bool {
        self.started && self.ended
    }
}

struct ScopeInner {
    id: u64,
    kind: ScopeKind,
    warning_interval: Duration,
    signals: watch::Sender<Signals>,
    end_hooks: Mutex<Vec<EndHook>>,
    warning: Mutex<Option<AbortHandle>>,
}

/// Handle to an admission window; clones refer to the same scope
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create a pending scope
    pub fn new(kind: ScopeKind, warning_interval: Duration) -> Self {
        let (signals, _) = watch::channel(Signals::default());
        Self {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                warning_interval,
                signals,
                end_hooks: Mutex::new(Vec::new()),
                warning: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    pub fn state(&self) -> ScopeState {
        let signals = *self.inner.signals.borrow();
        if signals.ended {
            ScopeState::Ended
        } else if signals.started {
            ScopeState::Started
        } else {
            ScopeState::Pending
        }
    }

    pub fn is_ended(&self) -> bool {
        self.inner.signals.borrow().ended
    }

    /// Admit everyone waiting on this scope.
    ///
    /// Fails if the scope was started before. A scope that was ended while
    /// still pending is marked started so that waiters registered before the
    /// end are released, but no warning timer is armed for it.
    pub fn start(&self) -> SqliteResult<()> {
        let mut already_started = false;
        let mut ended = false;
        self.inner.signals.send_if_modified(|signals| {
            if signals.started {
                already_started = true;
                return false;
            }
            signals.started = true;
            ended = signals.ended;
            true
        });
        if already_started {
            return Err(SqliteError::ScopeAlreadyStarted(self.id()));
        }

        debug!(scope_id = self.id(), kind = ?self.kind(), "scope started");
        if ended {
            self.run_end_hooks();
        } else {
            self.arm_warning();
        }
        Ok(())
    }

    /// Close the window. Repeated calls have no further effect.
    pub fn end(&self) {
        let mut started = false;
        let first = self.inner.signals.send_if_modified(|signals| {
            if signals.ended {
                return false;
            }
            signals.ended = true;
            started = signals.started;
            true
        });
        if !first {
            return;
        }

        if let Some(warning) = self.inner.warning.lock().take() {
            warning.abort();
        }
        debug!(scope_id = self.id(), kind = ?self.kind(), "scope ended");
        if started {
            self.run_end_hooks();
        }
    }

    /// Resolve once the scope has started.
    ///
    /// A scope that has already ended can no longer admit anyone, so this
    /// fails instead of waiting forever.
    pub async fn wait_started(&self) -> SqliteResult<()> {
        let mut rx = self.inner.signals.subscribe();
        let ended = rx.borrow_and_update().ended;
        if ended {
            return Err(SqliteError::ScopeEnded(self.id()));
        }
        rx.wait_for(|signals| signals.started)
            .await
            .map(|_| ())
            .map_err(|_| SqliteError::ScopeEnded(self.id()))
    }

    /// Resolve once the scope has ended (and, if it was ended early, started)
    pub async fn wait_ended(&self) {
        let mut rx = self.inner.signals.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(Signals::end_signaled).await;
    }

    /// Run `hook` once the end signal fires, or right away if it already has.
    pub(crate) fn on_end(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.end_hooks.lock();
            if !self.inner.signals.borrow().end_signaled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    fn run_end_hooks(&self) {
        let hooks = std::mem::take(&mut *self.inner.end_hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    pub(crate) fn same_as(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn arm_warning(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(scope_id = self.id(), "no runtime available, long-scope warning disabled");
            return;
        };

        let id = self.id();
        let kind = self.kind();
        let interval = self.inner.warning_interval;
        let mut rx = self.inner.signals.subscribe();
        let watcher = async move {
            let mut open_for = Duration::ZERO;
            loop {
                tokio::select! {
                    // Also resolves when every handle to the scope is dropped.
                    _ = async { rx.wait_for(|signals| signals.ended).await.is_ok() } => break,
                    _ = tokio::time::sleep(interval) => {
                        open_for += interval;
                        warn!(
                            scope_id = id,
                            kind = ?kind,
                            open_secs = open_for.as_secs(),
                            "scope is still open; long-lived scopes are allowed but should be ended eventually"
                        );
                    }
                }
            }
        };
        // Keep the caller's span so the warning can be traced back to it.
        let task = handle.spawn(watcher.instrument(tracing::Span::current()));

        let mut warning = self.inner.warning.lock();
        if self.is_ended() {
            task.abort();
        } else {
            *warning = Some(task.abort_handle());
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    fn user_scope() -> Scope {
        Scope::new(ScopeKind::User, DEFAULT_WARNING_INTERVAL)
    }

    #[test]
    fn lifecycle_moves_forward() {
        let scope = user_scope();
        assert_eq!(scope.state(), ScopeState::Pending);
        scope.start().unwrap();
        assert_eq!(scope.state(), ScopeState::Started);
        scope.end();
        assert_eq!(scope.state(), ScopeState::Ended);
    }

    #[test]
    fn double_start_is_rejected() {
        let scope = user_scope();
        scope.start().unwrap();
        assert!(matches!(
            scope.start(),
            Err(SqliteError::ScopeAlreadyStarted(id)) if id == scope.id()
        ));
    }

    #[test]
    fn end_is_idempotent_and_runs_hooks_once() {
        let scope = user_scope();
        scope.start().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scope.on_end(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scope.end();
        scope.end();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_on_ended_scope_runs_immediately() {
        let scope = user_scope();
        scope.start().unwrap();
        scope.end();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scope.on_end(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_are_released_by_start() {
        let scope = user_scope();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.wait_started().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        scope.start().unwrap();
        waiter.await.unwrap().unwrap();

        // Later waiters resolve immediately.
        scope.wait_started().await.unwrap();
        scope.end();
    }

    #[tokio::test]
    async fn waiting_on_ended_scope_fails() {
        let scope = user_scope();
        scope.start().unwrap();
        scope.end();
        assert!(matches!(
            scope.wait_started().await,
            Err(SqliteError::ScopeEnded(_))
        ));
        scope.wait_ended().await;
    }

    #[tokio::test]
    async fn pending_scope_ended_then_started_releases_earlier_waiters() {
        let scope = user_scope();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.wait_started().await })
        };
        while scope.inner.signals.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }

        scope.end();
        assert!(scope.wait_started().await.is_err());
        assert!(!waiter.is_finished());

        scope.start().unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(scope.state(), ScopeState::Ended);
        scope.wait_ended().await;
    }

    #[test]
    fn end_hooks_of_pending_scope_wait_for_start() {
        let scope = user_scope();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scope.on_end(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        scope.end();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        scope.start().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_timer_stops_when_scope_ends() {
        let scope = Scope::new(ScopeKind::User, Duration::from_secs(10));
        scope.start().unwrap();
        assert!(scope.inner.warning.lock().is_some());

        tokio::time::sleep(Duration::from_secs(25)).await;
        scope.end();
        assert!(scope.inner.warning.lock().is_none());
    }

    fn count_warnings(lines: &[&str], expected: usize) -> Result<(), String> {
        let found = lines
            .iter()
            .filter(|line| line.contains("scope is still open"))
            .count();
        if found == expected {
            Ok(())
        } else {
            Err(format!("expected {} warnings, found {}", expected, found))
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn open_scope_warns_every_interval_until_ended() {
        let scope = Scope::new(ScopeKind::User, Duration::from_secs(10));
        scope.start().unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(logs_contain("open_secs=10"));
        assert!(logs_contain("open_secs=20"));
        logs_assert(|lines| count_warnings(lines, 2));

        scope.end();
        tokio::time::sleep(Duration::from_secs(30)).await;
        logs_assert(|lines| count_warnings(lines, 2));
    }
}
