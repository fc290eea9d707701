//! Change subscriptions.

use std::sync::Arc;

use crate::record::{Record, RecordKind};
use crate::scope::{ScopeDescriptor, ScopeKey};
use crate::subscription::SubscriptionHandle;

use super::RecordSync;

impl RecordSync {
    /// Watch a scope. `callback` receives the full snapshot once at start
    /// and again whenever it changes.
    ///
    /// Subscribers to the same `(kind, scope)` share one underlying
    /// listener. Native push is used when the active provider has it,
    /// otherwise the scope is polled and diffed.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use record_sync::{RecordSync, RecordKind, ScopeDescriptor};
    /// # async fn example(sync: &RecordSync) {
    /// let handle = sync.subscribe(RecordKind::RelationshipRequest, ScopeDescriptor::owner("b@example.com"), |requests| {
    ///     println!("{} pending requests", requests.len());
    /// });
    /// // ...
    /// handle.cancel();
    /// # }
    /// ```
    pub fn subscribe<F>(&self, kind: RecordKind, scope: ScopeDescriptor, callback: F) -> SubscriptionHandle
    where
        F: Fn(&[Record]) + Send + Sync + 'static,
    {
        let scope = match scope {
            ScopeDescriptor::Public { limit } => ScopeDescriptor::public(self.public_limit(limit)),
            other => other,
        };
        self.subscriptions.subscribe(ScopeKey::new(kind, scope), Arc::new(callback))
    }

    /// Number of `(kind, scope)` keys with a running listener.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_keys()
    }
}
