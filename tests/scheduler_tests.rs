//! End-to-end tests of the scheduler core against a real store.
//!
//! The genetic algorithm is stochastic, so these tests do not pin exact placements. Instead
//! they seed the random stream, run the full loop against a small in-memory school, and verify
//! the properties that must hold of any correct run: placements stay in bounds, no lesson
//! appears twice on a day, the placed and unscheduled pools stay disjoint, the best cost never
//! worsens, and conflicting lessons are pulled apart. This mirrors how the scheduler misbehaves
//! in practice: a bug rarely produces a slightly different timetable, it produces one that
//! violates an invariant.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use rand::{SeedableRng, rngs::StdRng};
use rota::{
    data::UserType,
    scheduler::{Population, data::SchedulerData},
    testutil::*,
};

/// Builds scheduler data covering `days` days from the given school. The gateway admits at
/// most `days` candidates per group, so multi-day snapshots are needed to get several lessons
/// of one group into the same run.
fn snapshot(school: &TestSchool, seed: u64, days: u32) -> Result<Arc<SchedulerData>> {
    let first_day = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
    let options = fast_options(seed);
    let store = school.store.read();
    Ok(Arc::new(SchedulerData::fetch(
        &*store,
        options.scheduler,
        options.time,
        days,
        first_day,
        first_day,
        first_day,
    )?))
}

/// Verifies that every generation preserves the structural invariants of a timetable.
#[test]
fn generation_invariants() -> Result<()> {
    let mut school = TestSchool::new()?;
    let group = school.add_group("11X/Ma1", 3)?;
    let other = school.add_group("11X/Ma2", 2)?;
    for i in 0..4 {
        school.add_unscheduled_lesson(group.group_id, 60, &format!("Topic {i}"))?;
        school.add_unscheduled_lesson(other.group_id, 45, &format!("Other {i}"))?;
    }

    let data = snapshot(&school, 42, 3)?;
    assert_eq!(data.candidates.len(), 6);
    let mut rng = StdRng::seed_from_u64(42);
    let mut population = Population::new(data.clone(), &mut rng)?;

    for _ in 0..10 {
        population.iterate(&mut rng);
        for timetable in population.timetables() {
            let mut placed = HashSet::new();
            for day in 0..timetable.num_days() {
                let mut day_ids = HashSet::new();
                for lesson in timetable.day(day) {
                    // Placement bounds.
                    let start = lesson.relative_start().unwrap();
                    assert!(start <= data.time.max_start(lesson.duration_units));
                    // Uniqueness per day.
                    assert!(day_ids.insert(lesson.id), "lesson {} twice on a day", lesson.id);
                    placed.insert(lesson.id);
                }
            }
            // Disjoint pools.
            for lesson in timetable.unscheduled() {
                assert!(
                    !placed.contains(&lesson.id),
                    "lesson {} in both pools",
                    lesson.id
                );
            }
        }
    }
    Ok(())
}

/// Verifies that elitism keeps the best cost from worsening across generations.
#[test]
fn best_cost_never_worsens() -> Result<()> {
    let mut school = TestSchool::new()?;
    let group = school.add_group("11X/Ma1", 2)?;
    for i in 0..5 {
        school.add_unscheduled_lesson(group.group_id, 60, &format!("Topic {i}"))?;
    }

    let data = snapshot(&school, 7, 3)?;
    let mut rng = StdRng::seed_from_u64(7);
    let mut population = Population::new(data, &mut rng)?;

    let mut previous = f64::INFINITY;
    for _ in 0..15 {
        population.iterate(&mut rng);
        let best = population.best().unwrap().cached_cost().unwrap();
        assert!(best <= previous);
        previous = best;
    }
    Ok(())
}

/// Two lessons of the same group compete for the same teacher and student. The run must
/// converge to placements with no shared time unit for any participant.
#[test]
fn conflicting_lessons_pulled_apart() -> Result<()> {
    let mut school = TestSchool::new()?;
    let group = school.add_group("11X/Ma1", 1)?;
    school.add_unscheduled_lesson(group.group_id, 60, "First")?;
    school.add_unscheduled_lesson(group.group_id, 60, "Second")?;

    let data = snapshot(&school, 11, 2)?;
    assert_eq!(data.candidates.len(), 2);
    let mut rng = StdRng::seed_from_u64(11);
    let mut population = Population::new(data.clone(), &mut rng)?
        .with_stopping_condition(Box::new(|_, generations| generations >= 50));
    population.run(&mut rng, None)?;

    let best = population.into_best().unwrap();

    // The desired-volume pressure from the student makes placing both lessons cheaper than
    // leaving one unscheduled, and the clash penalty dwarfs everything else, so the winning
    // timetable holds both lessons with disjoint units for every participant.
    assert_eq!(best.num_placed(), 2);
    for day in 0..best.num_days() {
        let mut occupied = HashSet::new();
        for lesson in best.day(day) {
            let start = lesson.relative_start().unwrap();
            for unit in start..start + lesson.duration_units {
                assert!(occupied.insert(unit), "unit {unit} is taught twice");
            }
        }
    }
    Ok(())
}

/// Verifies that two runs from the same snapshot and seed produce the same timetable.
#[test]
fn identical_seeds_identical_runs() -> Result<()> {
    let run = |seed: u64| -> Result<Vec<(i64, Option<u32>)>> {
        let mut school = TestSchool::new()?;
        let group = school.add_group("11X/Ma1", 2)?;
        for i in 0..4 {
            school.add_unscheduled_lesson(group.group_id, 60, &format!("Topic {i}"))?;
        }
        let data = snapshot(&school, seed, 3)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut population = Population::new(data, &mut rng)?;
        population.run(&mut rng, None)?;

        let best = population.into_best().unwrap();
        let mut placements: Vec<_> = (0..best.num_days())
            .flat_map(|day| {
                best.day(day)
                    .iter()
                    .map(|lesson| (lesson.id, lesson.relative_start()))
                    .collect::<Vec<_>>()
            })
            .collect();
        placements.sort();
        Ok(placements)
    };

    assert_eq!(run(3)?, run(3)?);
    Ok(())
}

/// Verifies that the snapshot resolves the roster the cost function needs: the teacher and
/// every student of each group with candidates.
#[test]
fn snapshot_roster() -> Result<()> {
    let mut school = TestSchool::new()?;
    let group = school.add_group("11X/Ma1", 2)?;
    school.add_unscheduled_lesson(group.group_id, 60, "Topic")?;

    let data = snapshot(&school, 1, 1)?;
    assert_eq!(data.teacher(group.group_id), group.teacher_id);
    let participants = data.participants(group.group_id);
    assert_eq!(participants.len(), 3);
    assert_eq!(
        participants
            .iter()
            .filter(|(_, user_type)| *user_type == UserType::Student)
            .count(),
        2
    );
    assert_eq!(data.num_students, 2);
    Ok(())
}
