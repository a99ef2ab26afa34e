use async_trait::async_trait;
use futures::{stream, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{query, query_as, Postgres, Transaction};

use super::{not_found, Backend, Change, ChangeStream, Collection, Completion, ProgressStep};
use crate::db::Db;
use crate::error::{Result, SyncError};
use crate::models::{Course, Lesson, UserProgress};

/// Notification channel carrying JSON-encoded [`Change`] payloads.
pub const CHANGE_CHANNEL: &str = "coursesync_changes";

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: String,
    title: String,
    author: String,
    cover_url: Option<String>,
    description: Option<String>,
    difficulty: Option<String>,
    lessons: Json<Vec<Lesson>>,
    progress_percent: i32,
}

impl From<CourseRow> for Course {
    fn from(row: CourseRow) -> Self {
        Course {
            id: row.id,
            title: row.title,
            author: row.author,
            cover_url: row.cover_url,
            description: row.description,
            difficulty: row.difficulty,
            lessons: row.lessons.0,
            progress_percent: row.progress_percent,
        }
    }
}

pub struct PgBackend {
    db: Db,
}

impl PgBackend {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

// NOTIFY inside a transaction is only delivered on commit.
async fn notify(tx: &mut Transaction<'_, Postgres>, uid: &str, collection: Collection) -> Result<()> {
    let payload = serde_json::to_string(&Change {
        uid: uid.to_string(),
        collection,
    })
    .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;
    query("SELECT pg_notify($1, $2)")
        .bind(CHANGE_CHANNEL)
        .bind(payload)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl Backend for PgBackend {
    async fn list_courses(&self, uid: &str) -> Result<Vec<Course>> {
        let rows = query_as::<_, CourseRow>(
            r#"
            SELECT id, title, author, cover_url, description, difficulty, lessons, progress_percent
            FROM courses WHERE uid = $1 ORDER BY id
            "#,
        )
        .bind(uid)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Course::from).collect())
    }

    async fn get_course(&self, uid: &str, id: &str) -> Result<Option<Course>> {
        let row = query_as::<_, CourseRow>(
            r#"
            SELECT id, title, author, cover_url, description, difficulty, lessons, progress_percent
            FROM courses WHERE uid = $1 AND id = $2
            "#,
        )
        .bind(uid)
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Course::from))
    }

    async fn put_course(&self, uid: &str, course: &Course) -> Result<Course> {
        let mut tx = self.db.begin().await?;
        // progress_percent is only set on insert; complete_lesson owns it afterwards
        let stored = query_as::<_, CourseRow>(
            r#"
            INSERT INTO courses (uid, id, title, author, cover_url, description, difficulty, lessons, progress_percent)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (uid, id)
            DO UPDATE SET title=EXCLUDED.title, author=EXCLUDED.author, cover_url=EXCLUDED.cover_url,
                          description=EXCLUDED.description, difficulty=EXCLUDED.difficulty,
                          lessons=EXCLUDED.lessons, updated_at=now()
            RETURNING id, title, author, cover_url, description, difficulty, lessons, progress_percent
            "#,
        )
        .bind(uid)
        .bind(&course.id)
        .bind(&course.title)
        .bind(&course.author)
        .bind(&course.cover_url)
        .bind(&course.description)
        .bind(&course.difficulty)
        .bind(Json(&course.lessons))
        .bind(course.progress_percent)
        .fetch_one(&mut *tx)
        .await?;
        notify(&mut tx, uid, Collection::Courses).await?;
        tx.commit().await?;
        Ok(stored.into())
    }

    async fn delete_course(&self, uid: &str, id: &str) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let courses = query("DELETE FROM courses WHERE uid=$1 AND id=$2")
            .bind(uid)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let progress = query("DELETE FROM user_progress WHERE uid=$1 AND course_id=$2")
            .bind(uid)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if courses > 0 {
            notify(&mut tx, uid, Collection::Courses).await?;
        }
        if progress > 0 {
            notify(&mut tx, uid, Collection::Progress).await?;
        }
        tx.commit().await?;
        Ok(courses > 0)
    }

    async fn list_progress(&self, uid: &str) -> Result<Vec<UserProgress>> {
        Ok(query_as::<_, UserProgress>(
            r#"
            SELECT course_id, completed_lessons, total_lessons, certificates
            FROM user_progress WHERE uid = $1 ORDER BY course_id
            "#,
        )
        .bind(uid)
        .fetch_all(&self.db)
        .await?)
    }

    async fn get_progress(&self, uid: &str, course_id: &str) -> Result<Option<UserProgress>> {
        Ok(query_as::<_, UserProgress>(
            r#"
            SELECT course_id, completed_lessons, total_lessons, certificates
            FROM user_progress WHERE uid = $1 AND course_id = $2
            "#,
        )
        .bind(uid)
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn update_progress(
        &self,
        uid: &str,
        course_id: &str,
        step: &ProgressStep,
    ) -> Result<Completion> {
        let mut tx = self.db.begin().await?;

        // The course row lock serializes completions for the same course,
        // including the first one when no progress row exists yet.
        let course: Course = query_as::<_, CourseRow>(
            r#"
            SELECT id, title, author, cover_url, description, difficulty, lessons, progress_percent
            FROM courses WHERE uid = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(uid)
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| not_found(course_id))?
        .into();

        let current = query_as::<_, UserProgress>(
            r#"
            SELECT course_id, completed_lessons, total_lessons, certificates
            FROM user_progress WHERE uid = $1 AND course_id = $2
            FOR UPDATE
            "#,
        )
        .bind(uid)
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await?;

        let done = step(&course, current)?;

        query(
            r#"
            INSERT INTO user_progress (uid, course_id, completed_lessons, total_lessons, certificates)
            VALUES ($1,$2,$3,$4,$5)
            ON CONFLICT (uid, course_id)
            DO UPDATE SET completed_lessons=EXCLUDED.completed_lessons,
                          total_lessons=EXCLUDED.total_lessons,
                          certificates=EXCLUDED.certificates, updated_at=now()
            "#,
        )
        .bind(uid)
        .bind(course_id)
        .bind(done.progress.completed_lessons)
        .bind(done.progress.total_lessons)
        .bind(&done.progress.certificates)
        .execute(&mut *tx)
        .await?;

        query("UPDATE courses SET progress_percent=$3, updated_at=now() WHERE uid=$1 AND id=$2")
            .bind(uid)
            .bind(course_id)
            .bind(done.percent)
            .execute(&mut *tx)
            .await?;

        notify(&mut tx, uid, Collection::Progress).await?;
        notify(&mut tx, uid, Collection::Courses).await?;
        tx.commit().await?;
        Ok(done)
    }

    async fn listen(&self, uid: &str, collection: Collection) -> Result<ChangeStream> {
        let mut listener = PgListener::connect_with(&self.db).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        let watch = Watch {
            listener,
            uid: uid.to_string(),
            collection,
        };
        Ok(stream::unfold(Some(watch), |watch| async move {
            let mut watch = watch?;
            let changed = watch.changed().await;
            // the connection goes away with the terminal error
            let next = changed.is_ok().then_some(watch);
            Some((changed, next))
        })
        .boxed())
    }
}

/// Holds its own connection; dropping it ends the LISTEN registration.
struct Watch {
    listener: PgListener,
    uid: String,
    collection: Collection,
}

impl Watch {
    async fn changed(&mut self) -> Result<()> {
        loop {
            // try_recv reports a dropped connection as None instead of
            // silently reconnecting and losing notices.
            let Some(notification) = self.listener.try_recv().await? else {
                return Err(SyncError::RemoteUnavailable("change listener connection lost".into()));
            };
            match serde_json::from_str::<Change>(notification.payload()) {
                Ok(change) if change.uid == self.uid && change.collection == self.collection => {
                    return Ok(())
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, payload = notification.payload(), "ignoring malformed change notice");
                }
            }
        }
    }
}
