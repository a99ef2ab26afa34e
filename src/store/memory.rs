use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

use super::{not_found, Backend, Change, ChangeStream, Collection, Completion, ProgressStep};
use crate::error::{Result, SyncError};
use crate::models::{Course, UserProgress};
use crate::sample;

#[derive(Debug, Clone)]
enum Signal {
    Changed(Change),
    Outage,
}

#[derive(Default)]
struct Documents {
    // uid -> course id -> record
    courses: HashMap<String, BTreeMap<String, Course>>,
    progress: HashMap<String, BTreeMap<String, UserProgress>>,
    seeded: HashSet<String>,
}

/// In-process backend. One async mutex guards all documents, so every
/// read-modify-write is a serial transaction.
pub struct MemoryBackend {
    docs: Mutex<Documents>,
    signals: broadcast::Sender<Signal>,
    online: AtomicBool,
    seed_sample_data: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            docs: Mutex::new(Documents::default()),
            signals,
            online: AtomicBool::new(true),
            seed_sample_data: false,
        }
    }

    /// Every identity starts from the sample catalog and its progress
    /// records instead of an empty store.
    pub fn with_sample_data() -> Self {
        Self {
            seed_sample_data: true,
            ..Self::new()
        }
    }

    /// Simulates losing (or regaining) the connection to the store. Going
    /// offline fails every live listener.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was && !online {
            tracing::warn!("memory backend offline");
            let _ = self.signals.send(Signal::Outage);
        }
    }

    /// Number of live listener registrations.
    pub fn listener_count(&self) -> usize {
        self.signals.receiver_count()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::RemoteUnavailable("memory backend is offline".into()))
        }
    }

    /// Opens `uid`'s documents, seeding them on first use when enabled.
    fn open<'a>(&self, docs: &'a mut Documents, uid: &str) -> Result<&'a mut Documents> {
        self.ensure_online()?;
        if self.seed_sample_data && docs.seeded.insert(uid.to_string()) {
            tracing::debug!(uid, "seeding sample catalog");
            docs.courses.insert(
                uid.to_string(),
                sample::courses().into_iter().map(|c| (c.id.clone(), c)).collect(),
            );
            docs.progress.insert(
                uid.to_string(),
                sample::progress()
                    .into_iter()
                    .map(|p| (p.course_id.clone(), p))
                    .collect(),
            );
        }
        Ok(docs)
    }

    fn notify(&self, uid: &str, collection: Collection) {
        let _ = self.signals.send(Signal::Changed(Change {
            uid: uid.to_string(),
            collection,
        }));
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_courses(&self, uid: &str) -> Result<Vec<Course>> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;
        Ok(docs
            .courses
            .get(uid)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_course(&self, uid: &str, id: &str) -> Result<Option<Course>> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;
        Ok(docs.courses.get(uid).and_then(|c| c.get(id)).cloned())
    }

    async fn put_course(&self, uid: &str, course: &Course) -> Result<Course> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;
        let courses = docs.courses.entry(uid.to_string()).or_default();
        let mut stored = course.clone();
        if let Some(existing) = courses.get(&course.id) {
            stored.progress_percent = existing.progress_percent;
        }
        courses.insert(stored.id.clone(), stored.clone());
        drop(guard);
        self.notify(uid, Collection::Courses);
        Ok(stored)
    }

    async fn delete_course(&self, uid: &str, id: &str) -> Result<bool> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;
        let existed = docs
            .courses
            .get_mut(uid)
            .and_then(|c| c.remove(id))
            .is_some();
        let had_progress = docs
            .progress
            .get_mut(uid)
            .and_then(|p| p.remove(id))
            .is_some();
        drop(guard);
        if existed {
            self.notify(uid, Collection::Courses);
        }
        if had_progress {
            self.notify(uid, Collection::Progress);
        }
        Ok(existed)
    }

    async fn list_progress(&self, uid: &str) -> Result<Vec<UserProgress>> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;
        Ok(docs
            .progress
            .get(uid)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_progress(&self, uid: &str, course_id: &str) -> Result<Option<UserProgress>> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;
        Ok(docs.progress.get(uid).and_then(|p| p.get(course_id)).cloned())
    }

    async fn update_progress(
        &self,
        uid: &str,
        course_id: &str,
        step: &ProgressStep,
    ) -> Result<Completion> {
        let mut guard = self.docs.lock().await;
        let docs = self.open(&mut guard, uid)?;

        let course = docs
            .courses
            .get(uid)
            .and_then(|c| c.get(course_id))
            .cloned()
            .ok_or_else(|| not_found(course_id))?;
        let current = docs.progress.get(uid).and_then(|p| p.get(course_id)).cloned();

        let done = step(&course, current)?;

        docs.progress
            .entry(uid.to_string())
            .or_default()
            .insert(course_id.to_string(), done.progress.clone());
        if let Some(stored) = docs.courses.get_mut(uid).and_then(|c| c.get_mut(course_id)) {
            stored.progress_percent = done.percent;
        }
        drop(guard);

        self.notify(uid, Collection::Progress);
        self.notify(uid, Collection::Courses);
        Ok(done)
    }

    async fn listen(&self, uid: &str, collection: Collection) -> Result<ChangeStream> {
        self.ensure_online()?;
        let watch = Watch {
            rx: self.signals.subscribe(),
            uid: uid.to_string(),
            collection,
        };
        Ok(stream::unfold(Some(watch), |watch| async move {
            let mut watch = watch?;
            let changed = watch.changed().await;
            // the receiver goes away with the terminal error
            let next = changed.is_ok().then_some(watch);
            Some((changed, next))
        })
        .boxed())
    }
}

/// One listener registration: a receiver on the signal channel.
struct Watch {
    rx: broadcast::Receiver<Signal>,
    uid: String,
    collection: Collection,
}

impl Watch {
    async fn changed(&mut self) -> Result<()> {
        loop {
            match self.rx.recv().await {
                Ok(Signal::Changed(change)) => {
                    if change.uid == self.uid && change.collection == self.collection {
                        return Ok(());
                    }
                }
                Ok(Signal::Outage) => {
                    return Err(SyncError::RemoteUnavailable("connection to store lost".into()))
                }
                // Missed notices: reload anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SyncError::RemoteUnavailable("store closed".into()))
                }
            }
        }
    }
}
