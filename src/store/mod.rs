//! Synchronization store: a cached, per-identity projection of the remote
//! course catalog and progress records.
//!
//! [`SyncStore`] owns the rules (id minting, lesson completion, stream
//! lifecycle); a [`Backend`] only provides document primitives, so the
//! in-memory and PostgreSQL backends behave identically.

mod feed;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DEFAULT_TOTAL_LESSONS;
use crate::error::{Result, SyncError};
use crate::models::{Course, UserProgress};
use crate::progress;
use crate::session::Session;

pub use feed::SnapshotStream;
use feed::FeedRegistry;
pub use memory::MemoryBackend;
pub use postgres::PgBackend;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Courses,
    Progress,
}

/// Change notice published by a backend after a committed write.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub uid: String,
    pub collection: Collection,
}

/// Values written back by one lesson completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub progress: UserProgress,
    pub percent: i32,
}

/// Read-modify-write step run inside a backend transaction: receives the
/// locked course and the current progress record (if any).
pub type ProgressStep = dyn Fn(&Course, Option<UserProgress>) -> Result<Completion> + Send + Sync;

/// Remote document store primitives, all scoped to one identity.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn list_courses(&self, uid: &str) -> Result<Vec<Course>>;

    async fn get_course(&self, uid: &str, id: &str) -> Result<Option<Course>>;

    /// Insert or replace, returning the stored record. `course.id` is never
    /// blank here. An existing course keeps its stored `progress_percent`.
    async fn put_course(&self, uid: &str, course: &Course) -> Result<Course>;

    /// Removes the course and its progress record atomically. Returns
    /// whether the course existed.
    async fn delete_course(&self, uid: &str, id: &str) -> Result<bool>;

    async fn list_progress(&self, uid: &str) -> Result<Vec<UserProgress>>;

    async fn get_progress(&self, uid: &str, course_id: &str) -> Result<Option<UserProgress>>;

    /// Runs `step` against the course and progress record in one atomic
    /// transaction, then writes the new progress record and the course's
    /// progress percent. Fails with `CourseNotFound` without writing if the
    /// course does not exist.
    async fn update_progress(
        &self,
        uid: &str,
        course_id: &str,
        step: &ProgressStep,
    ) -> Result<Completion>;

    /// Registers a change listener. The registration lives exactly as long
    /// as the returned stream.
    async fn listen(&self, uid: &str, collection: Collection) -> Result<ChangeStream>;
}

/// One `Ok(())` per change to the watched collection. An `Err` is terminal,
/// and so is the end of the stream.
pub type ChangeStream = BoxStream<'static, Result<()>>;

pub struct SyncStore {
    backend: Arc<dyn Backend>,
    session: Session,
    default_total_lessons: i32,
    course_feeds: FeedRegistry<Course>,
    progress_feeds: FeedRegistry<UserProgress>,
}

impl SyncStore {
    pub fn new(backend: Arc<dyn Backend>, session: Session) -> Self {
        Self {
            backend,
            session,
            default_total_lessons: DEFAULT_TOTAL_LESSONS,
            course_feeds: FeedRegistry::new(),
            progress_feeds: FeedRegistry::new(),
        }
    }

    /// Lessons assumed when a progress record has no usable total.
    pub fn with_default_total_lessons(mut self, total: i32) -> Result<Self> {
        if total <= 0 {
            return Err(SyncError::Validation(format!(
                "default total lessons must be positive, got {total}"
            )));
        }
        self.default_total_lessons = total;
        Ok(self)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Live catalog snapshots for the current identity. The latest snapshot
    /// is replayed to every new subscriber.
    pub async fn courses_stream(&self) -> Result<SnapshotStream<Course>> {
        let uid = self.session.uid()?;
        Ok(self.course_feeds.subscribe(&uid, &self.backend, &self.session))
    }

    pub async fn progress_stream(&self) -> Result<SnapshotStream<UserProgress>> {
        let uid = self.session.uid()?;
        Ok(self.progress_feeds.subscribe(&uid, &self.backend, &self.session))
    }

    pub async fn courses(&self) -> Result<Vec<Course>> {
        let uid = self.session.uid()?;
        self.backend.list_courses(&uid).await
    }

    pub async fn progress(&self) -> Result<Vec<UserProgress>> {
        let uid = self.session.uid()?;
        self.backend.list_progress(&uid).await
    }

    pub async fn get_course_by_id(&self, id: &str) -> Result<Option<Course>> {
        let uid = self.session.uid()?;
        self.backend.get_course(&uid, id).await
    }

    pub async fn get_progress(&self, course_id: &str) -> Result<Option<UserProgress>> {
        let uid = self.session.uid()?;
        self.backend.get_progress(&uid, course_id).await
    }

    /// Marks one more lesson of `course_id` as completed.
    ///
    /// The read-modify-write runs inside the backend's transaction, so
    /// concurrent calls for the same course serialize there; nothing is
    /// locked client-side.
    pub async fn complete_lesson(&self, course_id: &str) -> Result<UserProgress> {
        let uid = self.session.uid()?;
        let default_total = self.default_total_lessons;

        let step = move |course: &Course, current: Option<UserProgress>| -> Result<Completion> {
            let current = match current {
                Some(p) => progress::normalize(p, default_total),
                None => UserProgress::new(course.id.clone(), default_total),
            };
            let next = progress::apply_completion(&current, &course.title);
            let percent = progress::percent_of(&next)?;
            Ok(Completion {
                progress: next,
                percent,
            })
        };

        let done = self.backend.update_progress(&uid, course_id, &step).await?;
        tracing::info!(
            %uid,
            course_id,
            completed = done.progress.completed_lessons,
            total = done.progress.total_lessons,
            percent = done.percent,
            "lesson completed"
        );
        Ok(done.progress)
    }

    /// Inserts or replaces a course. A blank id is replaced by a fresh UUID.
    ///
    /// `progress_percent` is only ever written by [`complete_lesson`]: a new
    /// course starts at 0 and a replaced one keeps its stored value.
    ///
    /// [`complete_lesson`]: SyncStore::complete_lesson
    pub async fn add_course(&self, mut course: Course) -> Result<Course> {
        let uid = self.session.uid()?;
        if course.id.trim().is_empty() {
            course.id = Uuid::new_v4().to_string();
        }
        course.progress_percent = 0;
        let stored = self.backend.put_course(&uid, &course).await?;
        tracing::info!(%uid, course_id = %stored.id, title = %stored.title, "course stored");
        Ok(stored)
    }

    /// Deletes a course together with its progress record.
    pub async fn delete_course(&self, id: &str) -> Result<bool> {
        let uid = self.session.uid()?;
        let existed = self.backend.delete_course(&uid, id).await?;
        if existed {
            tracing::info!(%uid, course_id = id, "course deleted");
        } else {
            tracing::debug!(%uid, course_id = id, "delete of unknown course");
        }
        Ok(existed)
    }
}

pub(crate) fn not_found(id: &str) -> SyncError {
    SyncError::CourseNotFound(id.to_string())
}
