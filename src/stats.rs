use crate::model::{Activity, ActivityType, Student};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub total_students: usize,
    pub active_students: usize,
    pub completion_rate: u32,
}

fn class_matches(student: &Student, filter_class: Option<&str>) -> bool {
    match filter_class.map(str::trim) {
        None | Some("") => true,
        Some(c) if c.eq_ignore_ascii_case("all") => true,
        Some(c) => student.class.eq_ignore_ascii_case(c),
    }
}

pub fn filter_by_class<'a>(students: &'a [Student], filter_class: Option<&str>) -> Vec<&'a Student> {
    students
        .iter()
        .filter(|s| class_matches(s, filter_class))
        .collect()
}

/// Completion over the given activities for the students in `filter_class`
/// (`None` or `"all"` means every class).
///
/// The rate is the share of `(student, type)` slots marked done out of
/// `students × 9`, rounded to a whole percent; no students gives 0.
pub fn compute_stats(students: &[Student], activities: &[Activity], filter_class: Option<&str>) -> ClassStats {
    let filtered = filter_by_class(students, filter_class);
    let ids: HashSet<&str> = filtered.iter().map(|s| s.id.as_str()).collect();

    let mut done_slots: HashSet<(&str, ActivityType)> = HashSet::new();
    for a in activities.iter().filter(|a| a.is_done()) {
        if ids.contains(a.student_id.as_str()) {
            done_slots.insert((a.student_id.as_str(), a.activity_type));
        }
    }
    let active: HashSet<&str> = done_slots.iter().map(|(id, _)| *id).collect();

    let possible = filtered.len() * ActivityType::ALL.len();
    let completion_rate = if possible == 0 {
        0
    } else {
        (100.0 * done_slots.len() as f64 / possible as f64).round() as u32
    };

    ClassStats {
        total_students: filtered.len(),
        active_students: active.len(),
        completion_rate,
    }
}

pub fn is_done(student_id: &str, activity_type: ActivityType, activities: &[Activity]) -> bool {
    activities
        .iter()
        .any(|a| a.student_id == student_id && a.activity_type == activity_type && a.is_done())
}

/// Number of the five daily prayers marked done, 0 through 5.
pub fn prayer_count(student_id: &str, activities: &[Activity]) -> usize {
    ActivityType::ALL
        .iter()
        .filter(|t| t.is_prayer() && is_done(student_id, **t, activities))
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrayerBand {
    Full,
    Partial,
    None,
}

impl PrayerBand {
    pub fn classify(count: usize) -> Self {
        match count {
            0 => PrayerBand::None,
            n if n >= ActivityType::PRAYERS.len() => PrayerBand::Full,
            _ => PrayerBand::Partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardRow {
    pub student: Student,
    pub statuses: BTreeMap<&'static str, bool>,
    pub prayer_count: usize,
    pub prayer_band: PrayerBand,
}

pub fn dashboard_rows(students: &[Student], activities: &[Activity], filter_class: Option<&str>) -> Vec<DashboardRow> {
    filter_by_class(students, filter_class)
        .into_iter()
        .map(|s| {
            let statuses = ActivityType::ALL
                .iter()
                .map(|t| (t.as_str(), is_done(&s.id, *t, activities)))
                .collect();
            let count = prayer_count(&s.id, activities);
            DashboardRow {
                student: s.clone(),
                statuses,
                prayer_count: count,
                prayer_band: PrayerBand::classify(count),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTier {
    Complete,
    Almost,
    Halfway,
    Started,
    Start,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProgress {
    pub done_count: usize,
    pub total: usize,
    pub percent: u32,
    pub all_done: bool,
    pub tier: ProgressTier,
}

/// A student's own checklist progress over `activities` (normally one day).
pub fn student_progress(student_id: &str, activities: &[Activity]) -> StudentProgress {
    let total = ActivityType::ALL.len();
    let done_count = ActivityType::ALL
        .iter()
        .filter(|t| is_done(student_id, **t, activities))
        .count();
    let percent = (100.0 * done_count as f64 / total as f64).round() as u32;
    let all_done = done_count == total;
    let tier = if all_done {
        ProgressTier::Complete
    } else if percent >= 75 {
        ProgressTier::Almost
    } else if percent >= 50 {
        ProgressTier::Halfway
    } else if percent >= 25 {
        ProgressTier::Started
    } else {
        ProgressTier::Start
    };
    StudentProgress {
        done_count,
        total,
        percent,
        all_done,
        tier,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub total_students: usize,
    pub total_activities: usize,
    pub total_classes: usize,
    pub done_activities: usize,
    pub total_days: usize,
}

pub fn overview(students: &[Student], activities: &[Activity]) -> Overview {
    Overview {
        total_students: students.len(),
        total_activities: activities.len(),
        total_classes: students
            .iter()
            .map(|s| s.class.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
        done_activities: activities.iter().filter(|a| a.is_done()).count(),
        total_days: activities
            .iter()
            .map(|a| a.date.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActivityStatus;

    const D: &str = "2026-02-18";

    fn student(id: &str, class: &str) -> Student {
        Student {
            id: id.into(),
            name: format!("Student {id}"),
            class: class.into(),
        }
    }

    fn act(student_id: &str, t: ActivityType, status: ActivityStatus) -> Activity {
        Activity {
            id: format!("{student_id}-{}", t.as_str()),
            student_id: student_id.into(),
            date: D.into(),
            activity_type: t,
            status,
            note: String::new(),
        }
    }

    #[test]
    fn empty_input_has_zero_rate() {
        assert_eq!(compute_stats(&[], &[], None), ClassStats::default());
        assert_eq!(compute_stats(&[], &[], Some("1A")), ClassStats::default());
    }

    #[test]
    fn one_of_two_students_complete_is_fifty_percent() {
        let students = vec![student("a", "1A"), student("b", "1A")];
        let activities: Vec<Activity> = ActivityType::ALL
            .iter()
            .map(|t| act("a", *t, ActivityStatus::Done))
            .collect();
        let stats = compute_stats(&students, &activities, None);
        assert_eq!(
            stats,
            ClassStats {
                total_students: 2,
                active_students: 1,
                completion_rate: 50,
            }
        );
    }

    #[test]
    fn class_filter_and_pending_records_are_respected() {
        let students = vec![student("a", "1A"), student("b", "1B")];
        let activities = vec![
            act("a", ActivityType::Puasa, ActivityStatus::Pending),
            act("b", ActivityType::Puasa, ActivityStatus::Done),
            act("b", ActivityType::Sahur, ActivityStatus::Done),
            act("ghost", ActivityType::Puasa, ActivityStatus::Done),
        ];
        let only_a = compute_stats(&students, &activities, Some("1a"));
        assert_eq!(only_a.total_students, 1);
        assert_eq!(only_a.active_students, 0);
        assert_eq!(only_a.completion_rate, 0);

        let only_b = compute_stats(&students, &activities, Some("1B"));
        assert_eq!(only_b.active_students, 1);
        // 2 of 9 slots -> 22.2 -> 22
        assert_eq!(only_b.completion_rate, 22);

        let all = compute_stats(&students, &activities, Some("all"));
        assert_eq!(all.total_students, 2);
        // 2 of 18 slots -> 11.1 -> 11
        assert_eq!(all.completion_rate, 11);
    }

    #[test]
    fn prayer_count_and_bands() {
        let mut activities: Vec<Activity> = ActivityType::PRAYERS
            .iter()
            .map(|t| act("a", *t, ActivityStatus::Done))
            .collect();
        activities.push(act("a", ActivityType::Puasa, ActivityStatus::Done));
        assert_eq!(prayer_count("a", &activities), 5);
        assert_eq!(PrayerBand::classify(5), PrayerBand::Full);

        activities[0].status = ActivityStatus::Pending;
        assert_eq!(prayer_count("a", &activities), 4);
        assert_eq!(PrayerBand::classify(4), PrayerBand::Partial);
        assert_eq!(prayer_count("b", &activities), 0);
        assert_eq!(PrayerBand::classify(0), PrayerBand::None);

        let rows = dashboard_rows(&[student("a", "1A")], &activities, None);
        assert_eq!(rows[0].prayer_count, 4);
        assert_eq!(rows[0].statuses["puasa"], true);
        assert_eq!(rows[0].statuses["sahur"], false);
    }

    #[test]
    fn progress_tiers_follow_percent() {
        let all: Vec<Activity> = ActivityType::ALL
            .iter()
            .map(|t| act("a", *t, ActivityStatus::Done))
            .collect();
        let p = student_progress("a", &all);
        assert!(p.all_done);
        assert_eq!(p.tier, ProgressTier::Complete);

        let p = student_progress("a", &all[..7]);
        assert_eq!(p.percent, 78);
        assert_eq!(p.tier, ProgressTier::Almost);

        let p = student_progress("a", &all[..2]);
        assert_eq!(p.percent, 22);
        assert_eq!(p.tier, ProgressTier::Start);
    }

    #[test]
    fn overview_counts_classes_and_days() {
        let students = vec![student("a", "1A"), student("b", "1B"), student("c", "1A")];
        let mut activities = vec![
            act("a", ActivityType::Puasa, ActivityStatus::Done),
            act("b", ActivityType::Puasa, ActivityStatus::Pending),
        ];
        activities[1].date = "2026-02-19".into();
        let o = overview(&students, &activities);
        assert_eq!(o.total_students, 3);
        assert_eq!(o.total_classes, 2);
        assert_eq!(o.total_activities, 2);
        assert_eq!(o.done_activities, 1);
        assert_eq!(o.total_days, 2);
    }
}
