use async_trait::async_trait;
use futures::future::poll_fn;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::Poll;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{Backend, ChangeStream, Collection};
use crate::error::{Result, SyncError};
use crate::models::{Course, UserProgress};
use crate::session::{Session, SessionEvent};

/// A record type that can be streamed as whole-collection snapshots.
#[async_trait]
pub(crate) trait Document: Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    async fn load(backend: &dyn Backend, uid: &str) -> Result<Vec<Self>>;
}

#[async_trait]
impl Document for Course {
    const COLLECTION: Collection = Collection::Courses;

    async fn load(backend: &dyn Backend, uid: &str) -> Result<Vec<Self>> {
        backend.list_courses(uid).await
    }
}

#[async_trait]
impl Document for UserProgress {
    const COLLECTION: Collection = Collection::Progress;

    async fn load(backend: &dyn Backend, uid: &str) -> Result<Vec<Self>> {
        backend.list_progress(uid).await
    }
}

#[derive(Debug, Clone)]
enum FeedState<T> {
    Pending,
    Ready(Arc<Vec<T>>),
    Failed(SyncError),
}

/// The backend listener registration of one feed. The pump task only polls
/// it in place; ownership stays here so the feed can release it on drop.
enum Registration {
    Opening,
    Open(ChangeStream),
    Closed,
}

type RegistrationSlot = Arc<Mutex<Registration>>;

fn lock(slot: &Mutex<Registration>) -> MutexGuard<'_, Registration> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops the registration, if any, and keeps the slot closed for good.
fn release(slot: &Mutex<Registration>) {
    let registration = std::mem::replace(&mut *lock(slot), Registration::Closed);
    drop(registration);
}

/// One listener registration shared by every subscriber of a
/// `(uid, collection)` pair. Dropping the last subscriber releases the
/// registration before `drop` returns, then aborts the pump task.
struct Feed<T> {
    uid: String,
    state: watch::Receiver<FeedState<T>>,
    registration: RegistrationSlot,
    task: JoinHandle<()>,
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        release(&self.registration);
        self.task.abort();
        tracing::debug!(uid = %self.uid, "snapshot feed released");
    }
}

/// Continuous sequence of full snapshots.
///
/// `next` yields the latest snapshot first, then one snapshot per change.
/// A listener or load failure is yielded once as `Err`, after which the
/// stream is finished; subscribe again to restart it.
pub struct SnapshotStream<T> {
    _feed: Arc<Feed<T>>,
    rx: watch::Receiver<FeedState<T>>,
    primed: bool,
    finished: bool,
}

impl<T: Clone> SnapshotStream<T> {
    pub async fn next(&mut self) -> Option<Result<Arc<Vec<T>>>> {
        if self.finished {
            return None;
        }
        loop {
            if self.primed && self.rx.changed().await.is_err() {
                self.finished = true;
                return None;
            }
            self.primed = true;
            let state = self.rx.borrow_and_update().clone();
            match state {
                FeedState::Pending => continue,
                FeedState::Ready(snapshot) => return Some(Ok(snapshot)),
                FeedState::Failed(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

pub(crate) struct FeedRegistry<T> {
    feeds: Mutex<HashMap<String, Weak<Feed<T>>>>,
}

impl<T: Document> FeedRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the live feed for `uid`, or starts one. A feed whose listener
    /// has terminated is replaced.
    pub(crate) fn subscribe(
        &self,
        uid: &str,
        backend: &Arc<dyn Backend>,
        session: &Session,
    ) -> SnapshotStream<T> {
        let mut feeds = self.feeds.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        feeds.retain(|_, feed| feed.strong_count() > 0);

        let live = feeds
            .get(uid)
            .and_then(Weak::upgrade)
            .filter(|feed| !feed.task.is_finished())
            .filter(|feed| !matches!(*feed.state.borrow(), FeedState::Failed(_)));

        let feed = match live {
            Some(feed) => {
                tracing::debug!(uid, collection = ?T::COLLECTION, "joining snapshot feed");
                feed
            }
            None => {
                tracing::debug!(uid, collection = ?T::COLLECTION, "opening snapshot feed");
                let (tx, rx) = watch::channel(FeedState::Pending);
                let registration = Arc::new(Mutex::new(Registration::Opening));
                // Subscribed here, not in the task, so no session event is missed.
                let events = session.events();
                let task = tokio::spawn(pump::<T>(
                    backend.clone(),
                    uid.to_string(),
                    session.clone(),
                    events,
                    registration.clone(),
                    tx,
                ));
                let feed = Arc::new(Feed {
                    uid: uid.to_string(),
                    state: rx,
                    registration,
                    task,
                });
                feeds.insert(uid.to_string(), Arc::downgrade(&feed));
                feed
            }
        };

        SnapshotStream {
            rx: feed.state.clone(),
            _feed: feed,
            primed: false,
            finished: false,
        }
    }
}

async fn pump<T: Document>(
    backend: Arc<dyn Backend>,
    uid: String,
    session: Session,
    mut events: broadcast::Receiver<SessionEvent>,
    registration: RegistrationSlot,
    tx: watch::Sender<FeedState<T>>,
) {
    let fail = |e: SyncError| {
        release(&registration);
        tracing::warn!(%uid, collection = ?T::COLLECTION, error = %e, "snapshot feed terminated");
        tx.send_replace(FeedState::Failed(e));
    };

    if session.uid().ok().as_deref() != Some(uid.as_str()) {
        return fail(SyncError::NotAuthenticated);
    }

    // Register before the first load so no change slips in between.
    match backend.listen(&uid, T::COLLECTION).await {
        Ok(changes) => {
            let mut slot = lock(&registration);
            // every subscriber is already gone
            if matches!(*slot, Registration::Closed) {
                return;
            }
            *slot = Registration::Open(changes);
        }
        Err(e) => return fail(e),
    }

    loop {
        match T::load(backend.as_ref(), &uid).await {
            Ok(docs) => {
                tx.send_replace(FeedState::Ready(Arc::new(docs)));
            }
            Err(e) => return fail(e),
        }

        tokio::select! {
            changed = next_change(&registration) => {
                if let Err(e) = changed {
                    return fail(e);
                }
            }
            _ = identity_left(&mut events, &uid) => return fail(SyncError::NotAuthenticated),
        }
    }
}

/// Waits for the next change notice. The slot lock is only held while
/// polling, never across a suspension.
async fn next_change(registration: &Mutex<Registration>) -> Result<()> {
    poll_fn(|cx| match &mut *lock(registration) {
        Registration::Open(changes) => match changes.poll_next_unpin(cx) {
            Poll::Ready(Some(changed)) => Poll::Ready(changed),
            Poll::Ready(None) => Poll::Ready(Err(SyncError::RemoteUnavailable(
                "change listener closed".into(),
            ))),
            Poll::Pending => Poll::Pending,
        },
        Registration::Opening | Registration::Closed => Poll::Ready(Err(
            SyncError::RemoteUnavailable("change listener released".into()),
        )),
    })
    .await
}

/// Resolves once the session stops belonging to `uid`: a sign-out, or a
/// sign-in as someone else. Every event is seen, so signing out and back in
/// as the same user still ends the feed.
async fn identity_left(events: &mut broadcast::Receiver<SessionEvent>, uid: &str) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::SignedOut) => return,
            Ok(SessionEvent::SignedIn(identity)) if identity.uid != uid => return,
            Ok(_) => continue,
            // a missed event may have been a sign-out
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            // Session dropped; nothing can sign out any more.
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
