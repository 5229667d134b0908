//! Rota is the scheduling core of a school timetabling application. Teachers author lessons
//! without start times; once a day the driver lifts the pending pool out of the store and
//! searches for a concrete allocation of start times with a genetic algorithm, weighing
//! teacher and student clashes, workload curves, gaps between lessons, and fair rotation
//! between teaching groups. The single winning timetable of each run is written back as fixed
//! lessons for the surrounding web application to display.
//!
//! The search works on an integer time grid: the school day is divided into units of a few
//! minutes each, and every placement is a `(day, relative start)` pair. Wall-clock times only
//! exist at the edges, when lessons are read from and written to the store.
//!
//! Rota is named after the rota pinned to every staff-room wall: the sheet that says who is
//! where, and when.

pub mod data;
pub mod db_utils;
pub mod driver;
pub mod error;
pub mod scheduler;
pub mod store;
pub mod testutil;

use std::{collections::BTreeMap, fs, sync::Arc};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    data::{
        Group, GroupId, GroupStats, Lesson, LessonId, Link, NewLesson, RotaOptions, Subject,
        SubjectId, User, UserId, UserType, midnight,
    },
    driver::{CancelToken, Clock, Driver, SystemClock},
    error::ScheduleError,
    store::{TimetableStore, TimetableStoreDB},
};

/// The entry point of the crate: owns the store handle and the driver and exposes the store
/// surface to the surrounding application.
pub struct Rota {
    /// The persistence layer shared between the driver and the web surface.
    store: Arc<RwLock<dyn TimetableStore>>,

    /// The combined options of the crate.
    options: RotaOptions,

    /// The source of wall-clock time.
    clock: Arc<dyn Clock>,

    /// The daily driver.
    driver: Driver,
}

impl Rota {
    /// Creates a new instance backed by the SQLite database at the given path, with default
    /// options.
    pub fn new(db_path: &str) -> Result<Rota, ScheduleError> {
        Self::new_with_options(db_path, RotaOptions::default())
    }

    /// Creates a new instance backed by the SQLite database at the given path.
    pub fn new_with_options(db_path: &str, options: RotaOptions) -> Result<Rota, ScheduleError> {
        let store = TimetableStoreDB::new_from_disk(db_path).map_err(ScheduleError::Store)?;
        Self::with_clock(Arc::new(RwLock::new(store)), options, Arc::new(SystemClock))
    }

    /// Creates a new instance with options loaded from a JSON configuration file.
    pub fn new_from_config(db_path: &str, config_path: &str) -> Result<Rota, ScheduleError> {
        let contents = fs::read_to_string(config_path)
            .with_context(|| format!("cannot read configuration file at {config_path}"))
            .map_err(ScheduleError::Config)?;
        let options: RotaOptions = serde_json::from_str(&contents)
            .with_context(|| format!("cannot parse configuration file at {config_path}"))
            .map_err(ScheduleError::Config)?;
        Self::new_with_options(db_path, options)
    }

    /// Creates a new instance on top of an existing store handle and clock. Tests use this to
    /// inject an in-memory store and a pinned clock.
    pub fn with_clock(
        store: Arc<RwLock<dyn TimetableStore>>,
        options: RotaOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Rota, ScheduleError> {
        let driver = Driver::new(store.clone(), options, clock.clone())?;
        Ok(Rota {
            store,
            options,
            clock,
            driver,
        })
    }

    /// Returns the shared store handle.
    #[must_use]
    pub fn store(&self) -> Arc<RwLock<dyn TimetableStore>> {
        self.store.clone()
    }

    /// Performs one driver tick now. See [Driver::tick].
    pub fn tick(&self, cancel: &CancelToken) -> Result<usize, ScheduleError> {
        self.driver.tick(cancel)
    }

    /// Runs the driver until cancelled, ticking once per day at the configured time. Blocking
    /// call; run it on its own thread.
    pub fn run_loop(&self, cancel: &CancelToken) {
        self.driver.run_loop(cancel);
    }

    /// Schedules a single day on demand, regardless of the look-ahead window. The
    /// term-progress reference point is taken from the gateway rather than pinned to today,
    /// so a manual run weights the even-allocation term by real progress through the school
    /// year.
    pub fn schedule_day(&self, day: DateTime<Utc>) -> Result<bool, ScheduleError> {
        let now = self.clock.now();
        let year_start = self.store.read().year_start(now)?;
        let mut rng = match self.options.scheduler.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        self.driver
            .schedule_day(midnight(day), year_start, now, &mut rng, None)
    }
}

impl TimetableStore for Rota {
    fn add_user(
        &mut self,
        user_type: UserType,
        title: Option<&str>,
        first_name: &str,
        last_name: &str,
        year_group: Option<&str>,
    ) -> Result<UserId, ScheduleError> {
        self.store
            .write()
            .add_user(user_type, title, first_name, last_name, year_group)
    }

    fn add_subject(&mut self, name: &str, abbreviation: &str) -> Result<SubjectId, ScheduleError> {
        self.store.write().add_subject(name, abbreviation)
    }

    fn add_group(&mut self, name: &str) -> Result<GroupId, ScheduleError> {
        self.store.write().add_group(name)
    }

    fn add_link(
        &mut self,
        user_id: UserId,
        group_id: GroupId,
        subject_id: SubjectId,
    ) -> Result<i64, ScheduleError> {
        self.store.write().add_link(user_id, group_id, subject_id)
    }

    fn add_lesson(&mut self, lesson: &NewLesson) -> Result<LessonId, ScheduleError> {
        self.store.write().add_lesson(lesson)
    }

    fn add_lessons(&mut self, lessons: &[NewLesson]) -> Result<(), ScheduleError> {
        self.store.write().add_lessons(lessons)
    }

    fn unscheduled_lessons(
        &self,
        first_day: DateTime<Utc>,
        per_group_cap: usize,
    ) -> Result<Vec<Lesson>, ScheduleError> {
        self.store.read().unscheduled_lessons(first_day, per_group_cap)
    }

    fn lessons_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, ScheduleError> {
        self.store.read().lessons_between(start, end)
    }

    fn has_lesson_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        self.store.read().has_lesson_between(start, end)
    }

    fn group_statistics(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<GroupId, GroupStats>, ScheduleError> {
        self.store.read().group_statistics(now)
    }

    fn students_of_group(&self, group_id: GroupId) -> Result<Vec<User>, ScheduleError> {
        self.store.read().students_of_group(group_id)
    }

    fn teacher_of_group(&self, group_id: GroupId) -> Result<Option<User>, ScheduleError> {
        self.store.read().teacher_of_group(group_id)
    }

    fn users_of_group(&self, group_id: GroupId) -> Result<Vec<User>, ScheduleError> {
        self.store.read().users_of_group(group_id)
    }

    fn year_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.store.read().year_start(now)
    }

    fn groups(&self) -> Result<Vec<Group>, ScheduleError> {
        self.store.read().groups()
    }

    fn subjects(&self) -> Result<Vec<Subject>, ScheduleError> {
        self.store.read().subjects()
    }

    fn links_of_group(&self, group_id: GroupId) -> Result<Vec<Link>, ScheduleError> {
        self.store.read().links_of_group(group_id)
    }
}
