//! Typed access to the `activities` collection.
//!
//! Nothing here writes audit entries; callers log after a mutation succeeds.

use crate::model::{
    as_document, Activity, ActivityFilter, ActivityStatus, ActivityType, ACTIVITIES,
};
use crate::store::{
    new_document_id, Direction, DocumentStore, ListenerRegistration, Query, Snapshot, WriteOp,
};
use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::mpsc::Receiver;

fn filter_query(filter: &ActivityFilter) -> Query {
    let mut q = Query::collection(ACTIVITIES);
    if let Some(student_id) = &filter.student_id {
        q = q.where_eq("studentId", student_id.as_str());
    }
    if let Some(date) = &filter.date {
        q = q.where_eq("date", date.as_str());
    }
    q.order_by("date", Direction::Asc)
}

fn typed(snaps: &[Snapshot]) -> Vec<Activity> {
    snaps
        .iter()
        .filter_map(|s| {
            let a = Activity::from_snapshot(s);
            if a.is_none() {
                tracing::warn!(id = %s.id, "skipping malformed activity document");
            }
            a
        })
        .collect()
}

pub fn query_activities(store: &DocumentStore, filter: &ActivityFilter) -> anyhow::Result<Vec<Activity>> {
    let snaps = store
        .query(&filter_query(filter))
        .context("failed to query activities")?;
    Ok(typed(&snaps))
}

/// Live view over the activities matching a filter.
///
/// Each delivery is the whole matching set, so readers only ever keep the
/// newest one.
pub struct ActivitySubscription {
    registration: ListenerRegistration,
    rx: Receiver<Vec<Snapshot>>,
}

impl ActivitySubscription {
    /// Drains pending deliveries and returns the newest, if any arrived since
    /// the last call.
    pub fn latest(&self) -> Option<Vec<Activity>> {
        let mut newest: Option<Vec<Snapshot>> = None;
        while let Ok(snaps) = self.rx.try_recv() {
            newest = Some(snaps);
        }
        newest.map(|s| typed(&s))
    }

    pub fn unsubscribe(self) {
        self.registration.remove();
    }
}

pub fn subscribe_activities(
    store: &DocumentStore,
    filter: ActivityFilter,
) -> anyhow::Result<ActivitySubscription> {
    let (registration, rx) = store
        .listen(filter_query(&filter))
        .context("failed to subscribe to activities")?;
    Ok(ActivitySubscription { registration, rx })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityPatch {
    pub status: Option<ActivityStatus>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub created: bool,
    pub before: Option<Activity>,
    pub after: Activity,
}

fn find_existing(
    store: &DocumentStore,
    student_id: &str,
    date: &str,
    activity_type: ActivityType,
) -> anyhow::Result<Option<Activity>> {
    let snaps = store.query(
        &Query::collection(ACTIVITIES)
            .where_eq("studentId", student_id)
            .where_eq("date", date)
            .where_eq("type", activity_type.as_str()),
    )?;
    Ok(typed(&snaps).into_iter().next())
}

/// Updates the record for `(student_id, date, activity_type)` or creates it.
///
/// The lookup and the write run in one store transaction, so two upserts of
/// the same key cannot both create a record.
pub fn upsert_activity(
    store: &DocumentStore,
    student_id: &str,
    date: &str,
    activity_type: ActivityType,
    patch: ActivityPatch,
) -> anyhow::Result<UpsertOutcome> {
    store
        .atomically(|| {
            let existing = find_existing(store, student_id, date, activity_type)?;
            match existing {
                Some(before) => {
                    let mut after = before.clone();
                    let mut fields = serde_json::Map::new();
                    if let Some(status) = patch.status {
                        after.status = status;
                        fields.insert("status".into(), json!(status.as_str()));
                    }
                    if let (Some(note), true) = (&patch.note, activity_type.takes_note()) {
                        after.note = note.clone();
                        fields.insert("note".into(), json!(note));
                    }
                    if !fields.is_empty() {
                        store.update(ACTIVITIES, &before.id, fields)?;
                    }
                    Ok(UpsertOutcome {
                        created: false,
                        before: Some(before),
                        after,
                    })
                }
                None => {
                    let note = if activity_type.takes_note() {
                        patch.note.unwrap_or_default()
                    } else {
                        String::new()
                    };
                    let mut after = Activity {
                        id: String::new(),
                        student_id: student_id.to_string(),
                        date: date.to_string(),
                        activity_type,
                        status: patch.status.unwrap_or(ActivityStatus::Done),
                        note,
                    };
                    after.id = store.add(ACTIVITIES, after.to_document())?;
                    Ok(UpsertOutcome {
                        created: true,
                        before: None,
                        after,
                    })
                }
            }
        })
        .with_context(|| {
            format!(
                "failed to upsert {} for student {} on {}",
                activity_type.as_str(),
                student_id,
                date
            )
        })
}

/// Flips an existing record between done and pending; a missing record is
/// created as done.
pub fn toggle_activity(
    store: &DocumentStore,
    student_id: &str,
    date: &str,
    activity_type: ActivityType,
) -> anyhow::Result<UpsertOutcome> {
    store.atomically(|| {
        let next = match find_existing(store, student_id, date, activity_type)? {
            Some(existing) => existing.status.toggled(),
            None => ActivityStatus::Done,
        };
        upsert_activity(
            store,
            student_id,
            date,
            activity_type,
            ActivityPatch {
                status: Some(next),
                note: None,
            },
        )
    })
}

/// Deletes the given ids in sequential batches of at most the store's batch
/// limit. Returns how many records actually existed and were removed.
pub fn delete_activities_batch(store: &DocumentStore, ids: &BTreeSet<String>) -> anyhow::Result<usize> {
    let ops: Vec<WriteOp> = ids
        .iter()
        .map(|id| WriteOp::Delete {
            collection: ACTIVITIES.to_string(),
            id: id.clone(),
        })
        .collect();
    let out = store.commit_chunked(ops)?;
    tracing::info!(
        requested = ids.len(),
        deleted = out.touched,
        batches = out.batches,
        "deleted activities"
    );
    Ok(out.touched)
}

pub fn delete_activities_for_student(store: &DocumentStore, student_id: &str) -> anyhow::Result<usize> {
    let ids: BTreeSet<String> = store
        .query(&Query::collection(ACTIVITIES).where_eq("studentId", student_id))
        .context("failed to list activities for student")?
        .into_iter()
        .map(|s| s.id)
        .collect();
    delete_activities_batch(store, &ids)
}

pub fn clear_all_activities(store: &DocumentStore) -> anyhow::Result<usize> {
    let ids: BTreeSet<String> = store
        .query(&Query::collection(ACTIVITIES))
        .context("failed to list activities")?
        .into_iter()
        .map(|s| s.id)
        .collect();
    delete_activities_batch(store, &ids)
}

/// Builds the write for a freshly created record. The id is assigned here so
/// later rows of the same run can refer to it before the batch commits.
pub(crate) fn create_op(activity: &mut Activity) -> WriteOp {
    if activity.id.is_empty() {
        activity.id = new_document_id();
    }
    WriteOp::Set {
        collection: ACTIVITIES.to_string(),
        id: activity.id.clone(),
        data: activity.to_document(),
    }
}

pub(crate) fn update_op(id: &str, status: ActivityStatus, note: Option<&str>) -> WriteOp {
    let mut fields = as_document(json!({ "status": status.as_str() }));
    if let Some(note) = note {
        fields.insert("note".into(), json!(note));
    }
    WriteOp::Update {
        collection: ACTIVITIES.to_string(),
        id: id.to_string(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_BATCH_LIMIT;

    const D: &str = "2026-02-18";

    fn store() -> DocumentStore {
        DocumentStore::in_memory(DEFAULT_BATCH_LIMIT).expect("store")
    }

    fn done() -> ActivityPatch {
        ActivityPatch {
            status: Some(ActivityStatus::Done),
            note: None,
        }
    }

    #[test]
    fn upsert_twice_leaves_one_done_record() {
        let store = store();
        let first = upsert_activity(&store, "s1", D, ActivityType::Puasa, done()).expect("first");
        let second = upsert_activity(&store, "s1", D, ActivityType::Puasa, done()).expect("second");
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.after.id, second.after.id);

        let all = query_activities(
            &store,
            &ActivityFilter {
                student_id: Some("s1".into()),
                date: Some(D.into()),
            },
        )
        .expect("query");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ActivityStatus::Done);
        assert_eq!(all[0].activity_type, ActivityType::Puasa);
    }

    #[test]
    fn note_is_kept_only_for_tadarus() {
        let store = store();
        let with_note = ActivityPatch {
            status: None,
            note: Some("Juz 1".into()),
        };
        let tadarus =
            upsert_activity(&store, "s1", D, ActivityType::Tadarus, with_note.clone()).expect("tadarus");
        assert_eq!(tadarus.after.note, "Juz 1");
        assert_eq!(tadarus.after.status, ActivityStatus::Done);

        let puasa = upsert_activity(&store, "s1", D, ActivityType::Puasa, with_note).expect("puasa");
        assert_eq!(puasa.after.note, "");

        let edited = upsert_activity(
            &store,
            "s1",
            D,
            ActivityType::Tadarus,
            ActivityPatch {
                status: None,
                note: Some("Juz 2".into()),
            },
        )
        .expect("edit note");
        assert_eq!(edited.before.expect("before").note, "Juz 1");
        assert_eq!(edited.after.note, "Juz 2");
    }

    #[test]
    fn toggle_flips_status() {
        let store = store();
        let a = toggle_activity(&store, "s1", D, ActivityType::SholatIsya).expect("create");
        assert_eq!(a.after.status, ActivityStatus::Done);
        let b = toggle_activity(&store, "s1", D, ActivityType::SholatIsya).expect("flip");
        assert_eq!(b.after.status, ActivityStatus::Pending);
        let c = toggle_activity(&store, "s1", D, ActivityType::SholatIsya).expect("flip back");
        assert_eq!(c.after.status, ActivityStatus::Done);
        assert_eq!(
            query_activities(&store, &ActivityFilter::default())
                .expect("query")
                .len(),
            1
        );
    }

    #[test]
    fn batch_delete_covers_every_id_across_chunks() {
        let store = DocumentStore::in_memory(4).expect("store");
        for (i, t) in ActivityType::ALL.iter().enumerate() {
            upsert_activity(&store, "s1", D, *t, done()).expect("upsert");
            upsert_activity(&store, &format!("s{}", i + 2), D, *t, done()).expect("upsert");
        }
        let deleted = delete_activities_for_student(&store, "s1").expect("delete");
        assert_eq!(deleted, 9);
        let left = query_activities(&store, &ActivityFilter::default()).expect("query");
        assert_eq!(left.len(), 9);
        assert!(left.iter().all(|a| a.student_id != "s1"));

        let mut ids: BTreeSet<String> = left.iter().map(|a| a.id.clone()).collect();
        ids.insert("already-gone".into());
        assert_eq!(delete_activities_batch(&store, &ids).expect("delete rest"), 9);
    }

    #[test]
    fn subscription_sees_latest_snapshot_until_unsubscribed() {
        let store = store();
        let sub = subscribe_activities(
            &store,
            ActivityFilter {
                student_id: None,
                date: Some(D.into()),
            },
        )
        .expect("subscribe");
        assert_eq!(sub.latest().expect("initial").len(), 0);
        assert!(sub.latest().is_none());

        toggle_activity(&store, "s1", D, ActivityType::Puasa).expect("toggle");
        toggle_activity(&store, "s2", D, ActivityType::Puasa).expect("toggle");
        toggle_activity(&store, "s2", "2026-02-19", ActivityType::Puasa).expect("other day");
        let latest = sub.latest().expect("update");
        assert_eq!(latest.len(), 2);

        sub.unsubscribe();
        assert_eq!(store.listener_count(), 0);
    }
}
