//! The task behind one subscribed key.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::timing::{debounce_window, poll_interval};
use super::Subscription;
use crate::resilience::fallback::ResilientStore;
use crate::storage::traits::{ChangeCallback, PushRegistration};

/// Why the push loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushExit {
    Stopped,
    FeedEnded,
}

pub(super) async fn run(
    sub: Arc<Subscription>,
    store: Arc<ResilientStore>,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(mut registration) = register_push(&sub, &store).await {
        sub.push.store(true, Ordering::Release);
        let exit = push_loop(&sub, &store, &mut registration, &mut cancel, &mut shutdown).await;
        // Dropping the registration unhooks the native listener
        drop(registration);
        sub.push.store(false, Ordering::Release);

        if exit == PushExit::Stopped {
            debug!(key = %sub.key(), "Subscription worker stopped");
            return;
        }
        warn!(key = %sub.key(), "Native change feed ended, polling instead");
    }

    poll_loop(&sub, &store, &mut cancel, &mut shutdown).await;
    debug!(key = %sub.key(), "Subscription worker stopped");
}

/// Hook the active provider's native change feed, if it has one.
async fn register_push(sub: &Arc<Subscription>, store: &ResilientStore) -> Option<PushRegistration> {
    let active = store.active().await;
    let push = active.store.as_push()?;

    let weak = Arc::downgrade(sub);
    let on_change: ChangeCallback = Arc::new(move || {
        if let Some(sub) = weak.upgrade() {
            sub.wake();
        }
    });

    match push.subscribe(sub.key().kind, &sub.key().scope, on_change).await {
        Ok(registration) => {
            debug!(key = %sub.key(), provider = %active.id, "Native push registered");
            Some(registration)
        }
        Err(e) => {
            warn!(key = %sub.key(), provider = %active.id, error = %e, "Push registration failed, polling instead");
            None
        }
    }
}

async fn push_loop(
    sub: &Subscription,
    store: &ResilientStore,
    // `&mut` so the future stays `Send` (the cancel closure is not `Sync`)
    registration: &mut PushRegistration,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> PushExit {
    refresh(sub, store).await;
    let window = debounce_window(sub.key());

    loop {
        if registration.feed_ended() {
            return PushExit::FeedEnded;
        }
        tokio::select! {
            _ = sub.wake.notified() => {}
            _ = cancel.changed() => return PushExit::Stopped,
            _ = shutdown.changed() => return PushExit::Stopped,
        }
        if registration.feed_ended() {
            return PushExit::FeedEnded;
        }
        if !sub.dirty.load(Ordering::Acquire) {
            continue;
        }

        // Coalesce a burst of events into one re-fetch
        tokio::select! {
            _ = tokio::time::sleep(window) => {}
            _ = cancel.changed() => return PushExit::Stopped,
            _ = shutdown.changed() => return PushExit::Stopped,
        }
        sub.dirty.store(false, Ordering::Release);
        refresh(sub, store).await;
    }
}

async fn poll_loop(
    sub: &Subscription,
    store: &ResilientStore,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let interval = poll_interval(sub.key());

    loop {
        if *cancel.borrow() || *shutdown.borrow() {
            break;
        }
        sub.dirty.store(false, Ordering::Release);
        crate::metrics::record_poll_tick(sub.key().kind);
        refresh(sub, store).await;

        // The next tick is scheduled only after this one settled
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = sub.wake.notified() => {}
            _ = cancel.changed() => break,
            _ = shutdown.changed() => break,
        }
    }
}

/// Fetch the key and notify listeners if the snapshot changed. The store
/// keeps the cache current. Failures skip this round.
async fn refresh(sub: &Subscription, store: &ResilientStore) {
    let snapshot = match store.refresh(sub.key()).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(key = %sub.key(), error = %e, "Subscription fetch failed, skipping round");
            return;
        }
    };
    if sub.is_closed() {
        return;
    }
    if sub.observe(snapshot) {
        crate::metrics::record_notification(sub.key().kind);
    }
}
