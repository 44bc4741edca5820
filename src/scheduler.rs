//! Ordering of community and user scopes
//!
//! The scheduler keeps a strict chain `community, user₁, community₂, user₂, …`.
//! Operations issued without a scope join whichever community scope is current
//! when they are issued. Requesting a user scope supersedes that community
//! scope; the user scope starts once the superseded scope has ended, and the
//! next community scope starts once the user scope ends.
//!
//! Ending the superseded community scope does not wait for operations that
//! were already admitted into it, so a transaction may begin while those are
//! still executing on the shared connection.

use crate::error::{SqliteError, SqliteResult};
use crate::scope::{Scope, ScopeKind, DEFAULT_WARNING_INTERVAL};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

struct SchedulerState {
    community: Scope,
    pending: Vec<Scope>,
    closed: bool,
}

/// Admission order for operations sharing one engine connection
#[derive(Clone)]
pub struct ScopeScheduler {
    state: Arc<Mutex<SchedulerState>>,
    warning_interval: Duration,
}

impl Default for ScopeScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_WARNING_INTERVAL)
    }
}

impl ScopeScheduler {
    /// Create a scheduler whose first community scope is already started
    pub fn new(warning_interval: Duration) -> Self {
        let community = Scope::new(ScopeKind::Community, warning_interval);
        if let Err(err) = community.start() {
            // A freshly created scope has never been started.
            error!(%err, "failed to start initial community scope");
        }
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                community,
                pending: Vec::new(),
                closed: false,
            })),
            warning_interval,
        }
    }

    /// Request a dedicated scope.
    ///
    /// The returned scope starts after the current community scope has been
    /// superseded. The caller must `end()` it once its statements are done,
    /// otherwise every later scope stays pending.
    pub fn new_scope(&self) -> SqliteResult<Scope> {
        let user = Scope::new(ScopeKind::User, self.warning_interval);
        let next = Scope::new(ScopeKind::Community, self.warning_interval);

        let superseded = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SqliteError::SchedulerClosed);
            }
            state.pending.push(user.clone());
            std::mem::replace(&mut state.community, next.clone())
        };
        debug!(
            user_scope = user.id(),
            superseded = superseded.id(),
            next_community = next.id(),
            "user scope queued"
        );

        let weak = Arc::downgrade(&self.state);
        let finished = user.clone();
        user.on_end(move || {
            start_scope(&next);
            remove_pending(&weak, &finished);
        });

        let admitted = user.clone();
        superseded.on_end(move || start_scope(&admitted));
        superseded.end();

        Ok(user)
    }

    /// Resolve the target scope (explicit, or the current community scope)
    /// and wait for it to start.
    pub async fn wait_scope_start(&self, scope: Option<&Scope>) -> SqliteResult<Scope> {
        let target = match scope {
            Some(scope) => scope.clone(),
            None => self.current_community(),
        };
        target.wait_started().await?;
        Ok(target)
    }

    /// Stop handing out scopes and wait for every outstanding one to end.
    pub async fn close(&self) {
        let (community, pending) = {
            let mut state = self.state.lock();
            state.closed = true;
            (state.community.clone(), state.pending.clone())
        };
        info!(pending = pending.len(), "closing scope scheduler");

        community.end();
        join_all(
            pending
                .iter()
                .chain(std::iter::once(&community))
                .map(|scope| scope.wait_ended()),
        )
        .await;

        self.state.lock().pending.clear();
        debug!("scope scheduler drained");
    }

    pub fn current_community(&self) -> Scope {
        self.state.lock().community.clone()
    }

    /// Number of user scopes created but not yet ended.
    ///
    /// A queued scope ended before its turn no longer counts, although it
    /// keeps its place in the chain until it has started.
    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|scope| !scope.is_ended())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn start_scope(scope: &Scope) {
    // Each scope in the chain has exactly one predecessor, so it is started once.
    if let Err(err) = scope.start() {
        error!(scope_id = scope.id(), %err, "scope chain started a scope twice");
    }
}

fn remove_pending(state: &Weak<Mutex<SchedulerState>>, scope: &Scope) {
    if let Some(state) = state.upgrade() {
        state.lock().pending.retain(|pending| !pending.same_as(scope));
    }
}
