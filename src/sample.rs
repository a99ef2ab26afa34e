//! Demo catalog for the in-memory store.

use crate::models::{Course, Lesson, UserProgress};
use crate::progress;

fn course(id: &str, title: &str, author: &str) -> Course {
    Course {
        id: id.into(),
        title: title.into(),
        author: author.into(),
        ..Default::default()
    }
}

fn lesson(title: &str, progress: i32) -> Lesson {
    Lesson {
        title: title.into(),
        progress,
    }
}

fn done(course_id: &str, completed: i32) -> UserProgress {
    UserProgress {
        completed_lessons: completed,
        ..UserProgress::new(course_id, 10)
    }
}

fn records() -> Vec<UserProgress> {
    vec![
        done("c1", 2),
        done("c2", 4),
        done("c4", 1),
        done("c5", 8),
        done("c6", 10),
        done("c8", 5),
        done("c9", 10),
    ]
}

/// Progress records of the demo identity. Finished courses already hold
/// their certificate.
pub fn progress() -> Vec<UserProgress> {
    let mut records = records();
    let titles = courses();
    for record in records.iter_mut().filter(|r| r.completed_lessons >= r.total_lessons) {
        if let Some(c) = titles.iter().find(|c| c.id == record.course_id) {
            record.certificates.push(progress::certificate_label(&c.title));
        }
    }
    records
}

/// The demo catalog. Each course's percent is derived from its progress
/// record, so the two agree from the start.
pub fn courses() -> Vec<Course> {
    let mut catalog = vec![
        Course {
            description: Some(
                "Un curso completo para aprender los fundamentos y aplicaciones avanzadas de la \
                 Inteligencia Artificial en el desarrollo de software."
                    .into(),
            ),
            difficulty: Some("Intermedio".into()),
            lessons: vec![
                lesson("Lección 1: Introducción a la IA", 100),
                lesson("Lección 2: Algoritmos de Búsqueda", 35),
                lesson("Lección 3: Redes Neuronales", 0),
            ],
            ..course("c1", "Curso de Desarrollo de IA", "Abel Huallullo")
        },
        Course {
            description: Some(
                "Lleva tus habilidades de Kotlin al siguiente nivel con programación funcional, \
                 corrutinas y flujos."
                    .into(),
            ),
            difficulty: Some("Avanzado".into()),
            lessons: vec![
                lesson("Lección 1: Conceptos básicos", 100),
                lesson("Lección 2: Funciones de orden superior", 20),
            ],
            ..course("c2", "Kotlin Funcional Avanzado", "JetBrains Team")
        },
        Course {
            description: Some(
                "Aprende a integrar Firebase en tus aplicaciones Android, desde la autenticación \
                 hasta bases de datos en tiempo real."
                    .into(),
            ),
            ..course("c3", "Firebase para Android", "Google Developers")
        },
        Course {
            description: Some(
                "Asegura la calidad de tu app con tests unitarios y de UI para Jetpack Compose.".into(),
            ),
            ..course("c4", "Testing en Jetpack Compose", "Android Devs")
        },
        course("c5", "Python para Data Science", "Ana García"),
        Course {
            difficulty: Some("Principiante".into()),
            ..course("c6", "Introducción a Docker", "Docker Inc.")
        },
        course("c7", "Programación Reactiva con RxJava", "Ana Gómez"),
        course("c8", "Machine Learning con Scikit-Learn", "Luis Ramos"),
        course("c9", "Desarrollo Web con Node.js", "Sofía Torres"),
    ];

    let records = records();
    for c in catalog.iter_mut() {
        if let Some(record) = records.iter().find(|r| r.course_id == c.id) {
            c.progress_percent = progress::percent_of(record).unwrap_or(0);
        }
    }
    catalog
}
