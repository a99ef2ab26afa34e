use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::models::Course;
use crate::store::SyncStore;

/// Validating front door for catalog writes. Bad input is rejected here,
/// before anything reaches the store.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<SyncStore>,
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn validate(mut course: Course) -> Result<Course> {
    course.id = course.id.trim().to_string();
    course.title = course.title.trim().to_string();
    course.author = course.author.trim().to_string();
    if course.title.is_empty() {
        return Err(SyncError::Validation("title must not be blank".into()));
    }
    if course.author.is_empty() {
        return Err(SyncError::Validation("author must not be blank".into()));
    }
    course.cover_url = trimmed(course.cover_url);
    course.description = trimmed(course.description);
    course.difficulty = trimmed(course.difficulty);
    Ok(course)
}

impl Catalog {
    pub fn new(store: Arc<SyncStore>) -> Self {
        Self { store }
    }

    pub async fn add_course(&self, course: Course) -> Result<Course> {
        let course = validate(course)?;
        self.store.add_course(course).await
    }

    pub async fn delete_course(&self, id: &str) -> Result<bool> {
        let id = id.trim();
        if id.is_empty() {
            return Err(SyncError::Validation("course id must not be blank".into()));
        }
        self.store.delete_course(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Identity, IdentityProvider, Session};
    use crate::store::{Backend, MemoryBackend};

    fn draft(title: &str, author: &str) -> Course {
        Course {
            title: title.into(),
            author: author.into(),
            ..Default::default()
        }
    }

    fn signed_in_catalog() -> (Catalog, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let session = Session::new();
        session
            .establish(Identity {
                uid: "u1".into(),
                provider: Some(IdentityProvider::Facebook),
                anonymous: false,
                display_name: None,
                photo_url: None,
            })
            .unwrap();
        let store = Arc::new(SyncStore::new(backend.clone(), session));
        (Catalog::new(store), backend)
    }

    #[test]
    fn validate_trims_fields() {
        let mut course = draft("  Rust 101 ", " Ferris ");
        course.cover_url = Some("   ".into());
        course.description = Some(" intro ".into());
        course.difficulty = Some(" Intermedio\n".into());
        let course = validate(course).unwrap();
        assert_eq!(course.title, "Rust 101");
        assert_eq!(course.author, "Ferris");
        assert_eq!(course.cover_url, None);
        assert_eq!(course.description.as_deref(), Some("intro"));
        assert_eq!(course.difficulty.as_deref(), Some("Intermedio"));
    }

    #[test]
    fn validate_rejects_blank_title_or_author() {
        assert!(matches!(validate(draft(" ", "a")), Err(SyncError::Validation(_))));
        assert!(matches!(validate(draft("t", "\t")), Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn blank_input_never_reaches_the_store() {
        let (catalog, backend) = signed_in_catalog();
        // an offline store would turn any remote call into RemoteUnavailable
        backend.set_online(false);
        assert!(matches!(
            catalog.add_course(draft("", "a")).await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            catalog.delete_course("  ").await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn add_then_delete() {
        let (catalog, backend) = signed_in_catalog();
        let added = catalog.add_course(draft("Kotlin", "JetBrains")).await.unwrap();
        assert!(!added.id.is_empty());
        assert_eq!(backend.list_courses("u1").await.unwrap().len(), 1);

        assert!(catalog.delete_course(&added.id).await.unwrap());
        assert!(!catalog.delete_course(&added.id).await.unwrap());
    }
}
