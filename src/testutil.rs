//! Contains utilities common to Rota tests.
//!
//! This module contains a builder for small in-memory schools (groups, teachers, students, and
//! unscheduled lessons), a pinned clock, and scaled-down scheduler options, so that the
//! end-to-end tests can drive the scheduler and the driver against known data without touching
//! the filesystem.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

use crate::{
    data::{GroupId, LessonId, NewLesson, RotaOptions, SchedulerOptions, UserId, UserType},
    driver::Clock,
    error::ScheduleError,
    store::{TimetableStore, TimetableStoreDB},
};

/// A clock pinned to a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A group created by [TestSchool], with the IDs of its teacher and students.
pub struct TestGroup {
    /// The ID of the group.
    pub group_id: GroupId,

    /// The ID of the group's teacher.
    pub teacher_id: UserId,

    /// The IDs of the group's students.
    pub student_ids: Vec<UserId>,
}

/// A small school backed by an in-memory store.
pub struct TestSchool {
    /// The store handle, shaped for direct injection into a driver.
    pub store: Arc<RwLock<dyn TimetableStore>>,

    /// The subject every link is created under.
    subject_id: i64,

    /// A counter to give every generated user a distinct name.
    next_user: usize,
}

impl TestSchool {
    /// Creates an empty school with a single subject.
    pub fn new() -> Result<TestSchool, ScheduleError> {
        let mut store = TimetableStoreDB::new_in_memory().map_err(ScheduleError::Store)?;
        let subject_id = store.add_subject("Mathematics", "Ma")?;
        Ok(TestSchool {
            store: Arc::new(RwLock::new(store)),
            subject_id,
            next_user: 0,
        })
    }

    /// Adds a group with one teacher and the given number of students.
    pub fn add_group(&mut self, name: &str, num_students: usize) -> Result<TestGroup, ScheduleError> {
        let mut store = self.store.write();
        let group_id = store.add_group(name)?;

        self.next_user += 1;
        let teacher_id = store.add_user(
            UserType::Teacher,
            Some("Dr"),
            &format!("Teacher{}", self.next_user),
            "Example",
            None,
        )?;
        store.add_link(teacher_id, group_id, self.subject_id)?;

        let mut student_ids = Vec::with_capacity(num_students);
        for _ in 0..num_students {
            self.next_user += 1;
            let student_id = store.add_user(
                UserType::Student,
                None,
                &format!("Student{}", self.next_user),
                "Example",
                Some("11"),
            )?;
            store.add_link(student_id, group_id, self.subject_id)?;
            student_ids.push(student_id);
        }

        Ok(TestGroup {
            group_id,
            teacher_id,
            student_ids,
        })
    }

    /// Adds an unscheduled lesson of the given length to the group.
    pub fn add_unscheduled_lesson(
        &self,
        group_id: GroupId,
        minutes: i64,
        topic: &str,
    ) -> Result<LessonId, ScheduleError> {
        self.store.write().add_lesson(&NewLesson {
            group_id,
            duration: TimeDelta::minutes(minutes),
            topic: topic.into(),
            start: None,
            fixed: false,
        })
    }

    /// Adds an already scheduled, fixed lesson to the group.
    pub fn add_fixed_lesson(
        &self,
        group_id: GroupId,
        minutes: i64,
        topic: &str,
        start: DateTime<Utc>,
    ) -> Result<LessonId, ScheduleError> {
        self.store.write().add_lesson(&NewLesson {
            group_id,
            duration: TimeDelta::minutes(minutes),
            topic: topic.into(),
            start: Some(start),
            fixed: true,
        })
    }
}

/// Returns options scaled down so that a full driver tick finishes in well under a second,
/// seeded for reproducibility.
#[must_use]
pub fn fast_options(seed: u64) -> RotaOptions {
    RotaOptions {
        scheduler: SchedulerOptions {
            popsize: 24,
            num_parents: 8,
            num_offspring: 16,
            guaranteed_surviving_parents: 2,
            max_generations: 25,
            seed: Some(seed),
            ..SchedulerOptions::default()
        },
        ..RotaOptions::default()
    }
}
