// Progress rules: pure functions over UserProgress

use crate::error::{Result, SyncError};
use crate::models::UserProgress;

pub fn clamp_percent(p: i64) -> i32 {
    p.clamp(0, 100) as i32
}

/// `round(completed * 100 / total)`, clamped to 0..=100.
pub fn percent_of(progress: &UserProgress) -> Result<i32> {
    let total = progress.total_lessons;
    if total <= 0 {
        return Err(SyncError::Division(total));
    }
    let raw = (f64::from(progress.completed_lessons) * 100.0 / f64::from(total)).round();
    Ok(clamp_percent(raw as i64))
}

pub fn certificate_label(course_title: &str) -> String {
    format!("Certificate of '{course_title}'")
}

/// Records one more completed lesson.
///
/// Capped at `total_lessons`: a record that is already complete comes back
/// unchanged, so the certificate is minted only on the step that reaches
/// the total.
pub fn apply_completion(progress: &UserProgress, course_title: &str) -> UserProgress {
    if progress.completed_lessons >= progress.total_lessons {
        return progress.clone();
    }
    let mut next = progress.clone();
    next.completed_lessons += 1;
    if next.completed_lessons == next.total_lessons {
        next.certificates.push(certificate_label(course_title));
    }
    next
}

/// Repairs a record read from the store: a non-positive total becomes
/// `default_total`, completed lessons are clamped into `0..=total`.
pub fn normalize(mut progress: UserProgress, default_total: i32) -> UserProgress {
    if progress.total_lessons <= 0 {
        progress.total_lessons = default_total;
    }
    progress.completed_lessons = progress.completed_lessons.clamp(0, progress.total_lessons);
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(completed: i32, total: i32) -> UserProgress {
        UserProgress {
            completed_lessons: completed,
            ..UserProgress::new("c1", total)
        }
    }

    #[test]
    fn clamp_percent_bounds() {
        assert_eq!(clamp_percent(-5), 0);
        assert_eq!(clamp_percent(0), 0);
        assert_eq!(clamp_percent(57), 57);
        assert_eq!(clamp_percent(100), 100);
        assert_eq!(clamp_percent(250), 100);
    }

    #[test]
    fn percent_rounds_to_nearest() {
        assert_eq!(percent_of(&at(1, 3)).unwrap(), 33);
        assert_eq!(percent_of(&at(2, 3)).unwrap(), 67);
        assert_eq!(percent_of(&at(1, 8)).unwrap(), 13);
        assert_eq!(percent_of(&at(10, 10)).unwrap(), 100);
    }

    #[test]
    fn percent_rejects_degenerate_total() {
        assert_eq!(percent_of(&at(0, 0)), Err(SyncError::Division(0)));
        assert_eq!(percent_of(&at(1, -2)), Err(SyncError::Division(-2)));
    }

    #[test]
    fn completion_mints_certificate_on_last_lesson() {
        let p = apply_completion(&at(9, 10), "Docker Basics");
        assert_eq!(p.completed_lessons, 10);
        assert_eq!(p.certificates, vec!["Certificate of 'Docker Basics'".to_string()]);
    }

    #[test]
    fn completion_is_noop_when_complete() {
        let done = apply_completion(&at(9, 10), "Docker Basics");
        let again = apply_completion(&done, "Docker Basics");
        assert_eq!(again, done);
    }

    #[test]
    fn normalize_repairs_bad_records() {
        let p = normalize(at(4, 0), 10);
        assert_eq!((p.completed_lessons, p.total_lessons), (4, 10));
        let p = normalize(at(15, 12), 10);
        assert_eq!((p.completed_lessons, p.total_lessons), (12, 12));
        let p = normalize(at(-3, 5), 10);
        assert_eq!(p.completed_lessons, 0);
    }

    proptest! {
        #[test]
        fn clamp_percent_is_identity_in_range(x in 0i64..=100) {
            prop_assert_eq!(clamp_percent(x), x as i32);
        }

        #[test]
        fn completion_never_decreases_percent(total in 1i32..200, completed in 0i32..200) {
            let p = at(completed.min(total), total);
            let next = apply_completion(&p, "t");
            prop_assert!(percent_of(&next).unwrap() >= percent_of(&p).unwrap());
            prop_assert!(next.completed_lessons <= total);
        }

        #[test]
        fn certificate_only_on_final_transition(total in 1i32..50, completed in 0i32..50) {
            let p = at(completed.min(total), total);
            let next = apply_completion(&p, "t");
            let minted = next.certificates.len() - p.certificates.len();
            let expected = usize::from(p.completed_lessons == total - 1);
            prop_assert_eq!(minted, expected);
        }

        #[test]
        fn repeated_completion_settles_at_total(total in 1i32..30, extra in 0usize..10) {
            let mut p = at(0, total);
            for _ in 0..(total as usize + extra) {
                p = apply_completion(&p, "t");
            }
            prop_assert_eq!(p.completed_lessons, total);
            prop_assert_eq!(p.certificates.len(), 1);
        }
    }
}
