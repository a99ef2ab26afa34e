use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_TOTAL_LESSONS;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub author: String,
    pub cover_url: Option<String>,
    pub description: Option<String>,
    pub difficulty: Option<String>,
    pub lessons: Vec<Lesson>,
    pub progress_percent: i32, // always within 0..=100 once stored
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub title: String,
    pub progress: i32,
}

/// Per-identity completion record for one course.
///
/// `course_id` is not checked against the catalog; orphaned records are
/// tolerated until their course is deleted.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProgress {
    pub course_id: String,
    pub completed_lessons: i32,
    pub total_lessons: i32,
    pub certificates: Vec<String>,
}

impl UserProgress {
    pub fn new(course_id: impl Into<String>, total_lessons: i32) -> Self {
        Self {
            course_id: course_id.into(),
            completed_lessons: 0,
            total_lessons,
            certificates: Vec::new(),
        }
    }
}

impl Default for UserProgress {
    fn default() -> Self {
        Self::new(String::new(), DEFAULT_TOTAL_LESSONS)
    }
}
