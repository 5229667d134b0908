use anyhow::Result;
use chrono::{TimeDelta, TimeZone, Utc};
use tempfile::tempdir;

use crate::{
    data::{NO_HISTORY_LOOKBACK_DAYS, NewLesson, UserType},
    store::{TimetableStore, TimetableStoreDB},
};

fn new_test_store() -> Result<TimetableStoreDB> {
    TimetableStoreDB::new_in_memory()
}

/// Verifies adding and retrieving the users linked to a group.
#[test]
fn group_membership() -> Result<()> {
    let mut store = new_test_store()?;
    let maths = store.add_subject("Mathematics", "Ma")?;
    let group = store.add_group("11X/Ma1")?;
    let teacher = store.add_user(UserType::Teacher, Some("Dr"), "Ada", "Lovelace", None)?;
    let student1 = store.add_user(UserType::Student, None, "Alan", "Turing", Some("11"))?;
    let student2 = store.add_user(UserType::Student, None, "Grace", "Hopper", Some("11"))?;
    store.add_link(teacher, group, maths)?;
    store.add_link(student1, group, maths)?;
    store.add_link(student2, group, maths)?;

    let students = store.students_of_group(group)?;
    assert_eq!(students.len(), 2);
    assert_eq!(students[0].first_name, "Alan");
    assert_eq!(students[1].first_name, "Grace");

    let found = store.teacher_of_group(group)?.unwrap();
    assert_eq!(found.id, teacher);
    assert_eq!(found.title.as_deref(), Some("Dr"));

    // Participants include the teacher and both students.
    assert_eq!(store.users_of_group(group)?.len(), 3);
    Ok(())
}

/// Verifies the read surface for groups, subjects, and links.
#[test]
fn group_and_subject_listing() -> Result<()> {
    let mut store = new_test_store()?;
    let maths = store.add_subject("Mathematics", "Ma")?;
    let physics = store.add_subject("Physics", "Ph")?;
    let group = store.add_group("11X/Ma1")?;
    let teacher = store.add_user(UserType::Teacher, Some("Dr"), "Ada", "Lovelace", None)?;
    store.add_link(teacher, group, maths)?;

    let subjects = store.subjects()?;
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0].abbreviation, "Ma");
    assert_eq!(subjects[1].id, physics);

    let groups = store.groups()?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "11X/Ma1");

    let links = store.links_of_group(group)?;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].user_id, teacher);
    assert_eq!(links[0].subject_id, maths);
    Ok(())
}

/// Verifies that a group without a teacher reports no teacher.
#[test]
fn group_without_teacher() -> Result<()> {
    let mut store = new_test_store()?;
    let maths = store.add_subject("Mathematics", "Ma")?;
    let group = store.add_group("11X/Ma1")?;
    let student = store.add_user(UserType::Student, None, "Alan", "Turing", Some("11"))?;
    store.add_link(student, group, maths)?;
    assert!(store.teacher_of_group(group)?.is_none());
    Ok(())
}

/// Verifies that a user linked to a group twice is reported once.
#[test]
fn duplicate_links_deduplicated() -> Result<()> {
    let mut store = new_test_store()?;
    let maths = store.add_subject("Mathematics", "Ma")?;
    let further = store.add_subject("Further Mathematics", "FM")?;
    let group = store.add_group("11X/Ma1")?;
    let student = store.add_user(UserType::Student, None, "Alan", "Turing", Some("11"))?;
    store.add_link(student, group, maths)?;
    store.add_link(student, group, further)?;
    assert_eq!(store.students_of_group(group)?.len(), 1);
    Ok(())
}

/// Verifies the unscheduled-lesson query against all combinations of start and fixed.
#[test]
fn unscheduled_lessons_query() -> Result<()> {
    let mut store = new_test_store()?;
    let group = store.add_group("11X/Ma1")?;
    let first_day = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    let hour = TimeDelta::hours(1);

    // Never scheduled, not fixed. Eligible.
    let eligible = store.add_lesson(&NewLesson {
        group_id: group,
        duration: hour,
        topic: "Differentiation".into(),
        start: None,
        fixed: false,
    })?;
    // Scheduled in the past, not fixed. Not eligible.
    store.add_lesson(&NewLesson {
        group_id: group,
        duration: hour,
        topic: "Integration".into(),
        start: Some(first_day - TimeDelta::days(1)),
        fixed: false,
    })?;
    // Scheduled past the first day, not fixed. Eligible again.
    let mutable = store.add_lesson(&NewLesson {
        group_id: group,
        duration: hour,
        topic: "Series".into(),
        start: Some(first_day + TimeDelta::days(2)),
        fixed: false,
    })?;
    // Fixed. Never eligible.
    store.add_lesson(&NewLesson {
        group_id: group,
        duration: hour,
        topic: "Vectors".into(),
        start: Some(first_day + TimeDelta::days(2)),
        fixed: true,
    })?;

    let lessons = store.unscheduled_lessons(first_day, 14)?;
    let ids: Vec<_> = lessons.iter().map(|l| l.id).collect();
    assert_eq!(ids, vec![eligible, mutable]);
    Ok(())
}

/// Verifies the per-group cap on the unscheduled pool, first seen wins.
#[test]
fn unscheduled_lessons_cap() -> Result<()> {
    let mut store = new_test_store()?;
    let group = store.add_group("11X/Ma1")?;
    let other = store.add_group("11X/Ma2")?;
    let first_day = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    for _ in 0..5 {
        for group_id in [group, other] {
            store.add_lesson(&NewLesson {
                group_id,
                duration: TimeDelta::hours(1),
                topic: "Topic".into(),
                start: None,
                fixed: false,
            })?;
        }
    }

    let lessons = store.unscheduled_lessons(first_day, 3)?;
    assert_eq!(lessons.len(), 6);
    assert_eq!(lessons.iter().filter(|l| l.group_id == group).count(), 3);

    // The lowest IDs of each group survive the cap.
    let mut ids: Vec<_> = lessons.iter().map(|l| l.id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

/// Verifies the group statistics accumulation and recency computation.
#[test]
fn group_statistics() -> Result<()> {
    let mut store = new_test_store()?;
    let group = store.add_group("11X/Ma1")?;
    let fresh = store.add_group("11X/Ma2")?;
    let now = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();

    // Two past lessons and one future lesson. The future one must not count.
    for (days_ago, minutes) in [(10, 60), (3, 30)] {
        store.add_lesson(&NewLesson {
            group_id: group,
            duration: TimeDelta::minutes(minutes),
            topic: "Topic".into(),
            start: Some(now - TimeDelta::days(days_ago)),
            fixed: true,
        })?;
    }
    store.add_lesson(&NewLesson {
        group_id: group,
        duration: TimeDelta::minutes(45),
        topic: "Topic".into(),
        start: Some(now + TimeDelta::days(1)),
        fixed: true,
    })?;

    let stats = store.group_statistics(now)?;
    assert_eq!(stats.len(), 2);
    let group_stats = stats[&group];
    assert_eq!(group_stats.allocated_secs, 90 * 60);
    assert_eq!(group_stats.days_since_last, 3);

    // A group with no history reports the documented lookback.
    let fresh_stats = stats[&fresh];
    assert_eq!(fresh_stats.allocated_secs, 0);
    assert_eq!(fresh_stats.days_since_last, NO_HISTORY_LOOKBACK_DAYS);
    Ok(())
}

/// Verifies fixture detection over a half-open day interval.
#[test]
fn has_lesson_between() -> Result<()> {
    let mut store = new_test_store()?;
    let group = store.add_group("11X/Ma1")?;
    let day = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    let next = day + TimeDelta::days(1);
    assert!(!store.has_lesson_between(day, next)?);

    store.add_lesson(&NewLesson {
        group_id: group,
        duration: TimeDelta::hours(1),
        topic: "Topic".into(),
        start: Some(day + TimeDelta::hours(9)),
        fixed: true,
    })?;
    assert!(store.has_lesson_between(day, next)?);
    assert!(!store.has_lesson_between(next, next + TimeDelta::days(1))?);
    Ok(())
}

/// Verifies the year-start fallback and its lesson-derived value.
#[test]
fn year_start() -> Result<()> {
    let mut store = new_test_store()?;
    let group = store.add_group("11X/Ma1")?;

    // With no lessons, the most recent 1 September wins.
    let spring = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
    assert_eq!(
        store.year_start(spring)?,
        Utc.with_ymd_and_hms(2023, 9, 1, 0, 0, 0).unwrap()
    );
    let autumn = Utc.with_ymd_and_hms(2024, 10, 4, 12, 0, 0).unwrap();
    assert_eq!(
        store.year_start(autumn)?,
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap()
    );

    // The earliest lesson start takes precedence.
    let earliest = Utc.with_ymd_and_hms(2023, 9, 12, 9, 0, 0).unwrap();
    for offset in [TimeDelta::days(30), TimeDelta::zero(), TimeDelta::days(7)] {
        store.add_lesson(&NewLesson {
            group_id: group,
            duration: TimeDelta::hours(1),
            topic: "Topic".into(),
            start: Some(earliest + offset),
            fixed: true,
        })?;
    }
    assert_eq!(store.year_start(spring)?, earliest);
    Ok(())
}

/// Verifies that a batch insert is atomic and survives reopening the database.
#[test]
fn add_lessons_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("rota.db");
    let mut store = TimetableStoreDB::new_from_disk(db_path.to_str().unwrap())?;
    let group = store.add_group("11X/Ma1")?;
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 8, 30, 0).unwrap();

    let rows: Vec<_> = (0..3)
        .map(|i| NewLesson {
            group_id: group,
            duration: TimeDelta::minutes(60),
            topic: format!("Topic {i}"),
            start: Some(start + TimeDelta::hours(i)),
            fixed: true,
        })
        .collect();
    store.add_lessons(&rows)?;

    let reopened = TimetableStoreDB::new_from_disk(db_path.to_str().unwrap())?;
    let lessons = reopened.lessons_between(start, start + TimeDelta::days(1))?;
    assert_eq!(lessons.len(), 3);
    assert_eq!(lessons[0].topic, "Topic 0");
    assert_eq!(lessons[0].start, Some(start));
    assert_eq!(lessons[0].duration, TimeDelta::minutes(60));
    assert!(lessons[0].fixed);
    Ok(())
}

/// Verifies that a batch insert referencing a missing group writes nothing.
#[test]
fn add_lessons_rolls_back() -> Result<()> {
    let mut store = new_test_store()?;
    let group = store.add_group("11X/Ma1")?;
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 8, 30, 0).unwrap();

    let rows = vec![
        NewLesson {
            group_id: group,
            duration: TimeDelta::minutes(60),
            topic: "Valid".into(),
            start: Some(start),
            fixed: true,
        },
        NewLesson {
            // A group that does not exist violates the foreign key and aborts the batch.
            group_id: group + 100,
            duration: TimeDelta::minutes(60),
            topic: "Invalid".into(),
            start: Some(start),
            fixed: true,
        },
    ];
    assert!(store.add_lessons(&rows).is_err());
    assert!(store
        .lessons_between(start, start + TimeDelta::days(1))?
        .is_empty());
    Ok(())
}
