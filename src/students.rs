use crate::activities;
use crate::model::{Student, STUDENTS};
use crate::store::{new_document_id, DocumentStore, Query, WriteOp};
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Roster written into an empty workspace.
pub const DEFAULT_ROSTER: [(&str, &str); 25] = [
    ("Ahmad", "1A"),
    ("Budi", "1B"),
    ("Citra", "1A"),
    ("Doni", "1B"),
    ("Eka", "1A"),
    ("Fahmi", "1B"),
    ("Gita", "1A"),
    ("Hadi", "1B"),
    ("Indah", "1A"),
    ("Joko", "1B"),
    ("Kartika", "1A"),
    ("Lutfi", "1B"),
    ("Maya", "1A"),
    ("Naufal", "1B"),
    ("Olivia", "1A"),
    ("Putra", "1B"),
    ("Qori", "1A"),
    ("Rizky", "1B"),
    ("Sari", "1A"),
    ("Toni", "1B"),
    ("Umi", "1A"),
    ("Vino", "1B"),
    ("Wulan", "1A"),
    ("Yusuf", "1B"),
    ("Zahra", "1A"),
];

/// Trims the name and upper-cases the class; `None` when either ends up blank.
pub fn clean_student_input(name: &str, class: &str) -> Option<(String, String)> {
    let name = name.trim();
    let class = class.trim().to_uppercase();
    if name.is_empty() || class.is_empty() {
        return None;
    }
    Some((name.to_string(), class))
}

pub fn list_students(store: &DocumentStore) -> anyhow::Result<Vec<Student>> {
    let snaps = store
        .query(&Query::collection(STUDENTS))
        .context("failed to list students")?;
    let mut out: Vec<Student> = snaps
        .iter()
        .filter_map(|s| {
            let student = Student::from_snapshot(s);
            if student.is_none() {
                tracing::warn!(id = %s.id, "skipping malformed student document");
            }
            student
        })
        .collect();
    out.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.class.cmp(&b.class))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(out)
}

pub fn get_student(store: &DocumentStore, id: &str) -> anyhow::Result<Option<Student>> {
    let snap = store
        .get(STUDENTS, id)
        .with_context(|| format!("failed to read student {}", id))?;
    Ok(snap.as_ref().and_then(Student::from_snapshot))
}

/// Creates a student. Blank input is not an error; it yields `None` and
/// writes nothing.
pub fn create_student(store: &DocumentStore, name: &str, class: &str) -> anyhow::Result<Option<Student>> {
    let Some((name, class)) = clean_student_input(name, class) else {
        return Ok(None);
    };
    let id = store
        .add(STUDENTS, Student::to_document(&name, &class))
        .context("failed to create student")?;
    Ok(Some(Student { id, name, class }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentEdit {
    pub before: Student,
    pub after: Student,
}

/// Renames or moves a student. `Ok(None)` for blank input or an unknown id.
pub fn update_student(
    store: &DocumentStore,
    id: &str,
    name: &str,
    class: &str,
) -> anyhow::Result<Option<StudentEdit>> {
    let Some((name, class)) = clean_student_input(name, class) else {
        return Ok(None);
    };
    let Some(before) = get_student(store, id)? else {
        return Ok(None);
    };
    store
        .update(STUDENTS, id, Student::to_document(&name, &class))
        .with_context(|| format!("failed to update student {}", id))?;
    Ok(Some(StudentEdit {
        before,
        after: Student {
            id: id.to_string(),
            name,
            class,
        },
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDeletion {
    pub student: Student,
    pub deleted_activities_count: usize,
}

/// Removes a student and, explicitly, every activity that references it.
/// Activities go first so a failure never leaves orphans behind a deleted
/// student.
pub fn delete_student(store: &DocumentStore, id: &str) -> anyhow::Result<Option<StudentDeletion>> {
    let Some(student) = get_student(store, id)? else {
        return Ok(None);
    };
    let deleted_activities_count = activities::delete_activities_for_student(store, id)?;
    store
        .delete(STUDENTS, id)
        .with_context(|| format!("failed to delete student {}", id))?;
    Ok(Some(StudentDeletion {
        student,
        deleted_activities_count,
    }))
}

/// Writes the default roster when the collection is empty. Returns the number
/// of students created.
pub fn seed_default_roster(store: &DocumentStore) -> anyhow::Result<usize> {
    if !store.is_empty(STUDENTS)? {
        return Ok(0);
    }
    let ops: Vec<WriteOp> = DEFAULT_ROSTER
        .iter()
        .map(|(name, class)| WriteOp::Set {
            collection: STUDENTS.to_string(),
            id: new_document_id(),
            data: Student::to_document(name, class),
        })
        .collect();
    let out = store.commit_chunked(ops).context("failed to seed students")?;
    tracing::info!(count = out.writes, "seeded default roster");
    Ok(out.writes)
}

/// Removes every student and activity. Logs are kept.
pub fn delete_all_students(store: &DocumentStore) -> anyhow::Result<usize> {
    activities::clear_all_activities(store)?;
    let ids: BTreeSet<String> = store
        .query(&Query::collection(STUDENTS))?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let ops: Vec<WriteOp> = ids
        .into_iter()
        .map(|id| WriteOp::Delete {
            collection: STUDENTS.to_string(),
            id,
        })
        .collect();
    Ok(store.commit_chunked(ops)?.touched)
}

/// Case-insensitive substring match on name or class.
pub fn search_students<'a>(students: &'a [Student], query: &str) -> Vec<&'a Student> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return students.iter().collect();
    }
    students
        .iter()
        .filter(|s| s.name.to_lowercase().contains(&q) || s.class.to_lowercase().contains(&q))
        .collect()
}

pub fn class_list(students: &[Student]) -> Vec<String> {
    students
        .iter()
        .map(|s| s.class.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Case-insensitive key on the trimmed `(name, class)` pair.
pub fn match_key(name: &str, class: &str) -> (String, String) {
    (name.trim().to_lowercase(), class.trim().to_lowercase())
}

/// Students keyed by [`match_key`]. The first of two students sharing a key
/// wins.
pub fn index_by_name_and_class(students: &[Student]) -> HashMap<(String, String), &Student> {
    let mut index = HashMap::new();
    for s in students {
        index.entry(match_key(&s.name, &s.class)).or_insert(s);
    }
    index
}
