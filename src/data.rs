//! Defines the basic data structures used by Rota to describe users, groups, subjects, and
//! lessons, the discretization of the school day into time units, and the options available to
//! control the behavior of the scheduler and the driver.

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The ID of a user row in the store.
pub type UserId = i64;

/// The ID of a group row in the store.
pub type GroupId = i64;

/// The ID of a subject row in the store.
pub type SubjectId = i64;

/// The ID of a lesson row in the store.
pub type LessonId = i64;

/// The role of a user within the school. The value is stored as lowercase text in the store.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserType {
    /// A student. Students carry a year group and attend the lessons of the groups they are
    /// linked to.
    Student,

    /// A teacher. Each group has exactly one teacher among its linked users.
    Teacher,

    /// An administrator. Admins are never participants in scheduling.
    Admin,
}

/// A user of the school: a student, a teacher, or an administrator.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    /// The ID of the user.
    pub id: UserId,

    /// The role of the user.
    pub user_type: UserType,

    /// An optional title, mostly used for teachers.
    pub title: Option<String>,

    /// The first name of the user.
    pub first_name: String,

    /// The last name of the user.
    pub last_name: String,

    /// The year group of the user. Only students carry one.
    pub year_group: Option<String>,
}

/// A teaching class. Membership and the group's teacher are derived through [Link] rows.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Group {
    /// The ID of the group.
    pub id: GroupId,

    /// The name of the group.
    pub name: String,
}

/// A subject taught at the school.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Subject {
    /// The ID of the subject.
    pub id: SubjectId,

    /// The full name of the subject.
    pub name: String,

    /// The abbreviation of the subject used in timetable cells.
    pub abbreviation: String,
}

/// A many-to-many binding of a user to a group with a subject context. Group membership and the
/// identity of a group's teacher are derived from these rows.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Link {
    /// The ID of the link.
    pub id: i64,

    /// The ID of the linked user.
    pub user_id: UserId,

    /// The ID of the group the user is linked to.
    pub group_id: GroupId,

    /// The ID of the subject the group teaches the user.
    pub subject_id: SubjectId,
}

/// A lesson as persisted in the store. A lesson with no start time is unscheduled and is a
/// candidate for the next scheduling run. A fixed lesson must be neither moved nor reconsidered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lesson {
    /// The ID of the lesson.
    pub id: LessonId,

    /// The ID of the group the lesson is taught to.
    pub group_id: GroupId,

    /// The length of the lesson.
    pub duration: TimeDelta,

    /// The topic of the lesson, as entered by the teacher.
    pub topic: String,

    /// The wall-clock start of the lesson. Absent exactly when the lesson is unscheduled.
    pub start: Option<DateTime<Utc>>,

    /// Whether the scheduler must leave this lesson alone. A lesson with a start time but with
    /// this flag unset was scheduled by a previous run but is still mutable.
    pub fixed: bool,
}

/// A lesson row to be inserted into the store, before an ID has been assigned.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewLesson {
    /// The ID of the group the lesson is taught to.
    pub group_id: GroupId,

    /// The length of the lesson.
    pub duration: TimeDelta,

    /// The topic of the lesson.
    pub topic: String,

    /// The wall-clock start of the lesson, if already scheduled.
    pub start: Option<DateTime<Utc>>,

    /// Whether the scheduler must leave this lesson alone.
    pub fixed: bool,
}

/// The scheduling history of one group, read once at the start of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GroupStats {
    /// The total number of seconds of lessons the group has received to date.
    pub allocated_secs: i64,

    /// The number of whole days since the group last had a lesson, measured midnight to
    /// midnight. Groups with no history report [`NO_HISTORY_LOOKBACK_DAYS`].
    pub days_since_last: i64,
}

/// The recency reported for a group that has never had a lesson. Large enough that such groups
/// dominate the variety term of the cost function and get scheduled first.
pub const NO_HISTORY_LOOKBACK_DAYS: i64 = 20;

/// Returns the midnight (UTC) of the day containing the given instant. Day boundaries, recency
/// in whole days, and the driver's look-ahead window are all measured from this point.
#[must_use]
pub fn midnight(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Options describing how the school day is discretized into integer time units. All scheduling
/// arithmetic happens in units; wall-clock times are only reconstructed when a timetable is
/// persisted.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct TimeOptions {
    /// The number of seconds in one time unit.
    pub seconds_per_unit: u32,

    /// The number of time units in one school day.
    pub time_per_day: u32,

    /// The wall-clock time at which the school day starts.
    pub day_start: NaiveTime,

    /// The number of time units of lessons each student should receive per day.
    pub desired_lesson_time: u32,
}

impl TimeOptions {
    /// Returns the number of whole time units the given duration spans. Durations are floored,
    /// so a lesson shorter than one unit spans zero units and is a data error.
    #[must_use]
    pub fn duration_units(&self, duration: TimeDelta) -> u32 {
        let seconds = duration.num_seconds().max(0);
        (seconds / i64::from(self.seconds_per_unit)) as u32
    }

    /// Returns the largest valid relative start for a lesson spanning the given number of
    /// units.
    #[must_use]
    pub fn max_start(&self, duration_units: u32) -> u32 {
        self.time_per_day.saturating_sub(duration_units)
    }

    /// Reconstructs the wall-clock start of a placement. `first_day` is the midnight the run
    /// was seeded with, `day` the index of the day within the timetable, and `relative_start`
    /// the placement's offset from day start in time units.
    #[must_use]
    pub fn lesson_start(
        &self,
        first_day: DateTime<Utc>,
        day: u32,
        relative_start: u32,
    ) -> DateTime<Utc> {
        first_day
            + TimeDelta::days(i64::from(day))
            + self.day_start.signed_duration_since(NaiveTime::MIN)
            + TimeDelta::seconds(i64::from(relative_start) * i64::from(self.seconds_per_unit))
    }

    /// Verifies that the time options are valid.
    pub fn verify(&self) -> Result<()> {
        if self.seconds_per_unit == 0 {
            bail!("invalid time options: seconds_per_unit must be greater than 0");
        }
        if self.time_per_day == 0 {
            bail!("invalid time options: time_per_day must be greater than 0");
        }
        Ok(())
    }
}

impl Default for TimeOptions {
    /// Returns the default time options: five-minute units, 114 units per day, and a day
    /// starting at 08:30.
    fn default() -> Self {
        TimeOptions {
            seconds_per_unit: 300,
            time_per_day: 114,
            day_start: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            desired_lesson_time: 44,
        }
    }
}

/// Options to control the genetic algorithm.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// The number of timetables kept in the population.
    pub popsize: usize,

    /// The number of lowest-cost timetables selected as parents each generation.
    pub num_parents: usize,

    /// The number of offspring generated from the parents each generation.
    pub num_offspring: usize,

    /// The number of best candidates carried unconditionally into the next generation.
    pub guaranteed_surviving_parents: usize,

    /// The number of mutation operations applied per day of a mutated timetable.
    pub mutation_amount: usize,

    /// The probability that a child is mutated when [`Self::mutate_on_every_child`] is off.
    pub mutation_chance: f64,

    /// Whether every child is mutated after crossover. The older variant mutated children with
    /// probability [`Self::mutation_chance`] instead.
    pub mutate_on_every_child: bool,

    /// The probability that the random seeder skips a gap it could otherwise fill.
    pub random_lesson_skip_probability: f64,

    /// The number of consecutive candidates the random seeder may fail to place before it
    /// abandons the remaining candidates.
    pub seed_failure_threshold: u32,

    /// The number of generations after which the default stopping condition stops the run.
    pub max_generations: usize,

    /// The master seed for the run's random stream. Runs with the same seed, snapshot, and
    /// options produce identical timetables. When absent, the driver seeds from entropy.
    pub seed: Option<u64>,
}

impl SchedulerOptions {
    /// Verifies that the scheduler options are valid.
    pub fn verify(&self) -> Result<()> {
        if self.popsize < 1 {
            bail!("invalid scheduler options: popsize must be greater than 0");
        }
        if self.num_parents < 1 {
            bail!("invalid scheduler options: num_parents must be greater than 0");
        }
        if self.num_parents > self.popsize {
            bail!("invalid scheduler options: num_parents cannot be greater than popsize");
        }
        if self.guaranteed_surviving_parents < 1 {
            bail!(
                "invalid scheduler options: guaranteed_surviving_parents must be greater than 0"
            );
        }
        if self.guaranteed_surviving_parents > self.num_parents {
            bail!(
                "invalid scheduler options: guaranteed_surviving_parents cannot be greater \
                than num_parents"
            );
        }
        if !(0.0..=1.0).contains(&self.mutation_chance) {
            bail!("invalid scheduler options: mutation_chance must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.random_lesson_skip_probability) {
            bail!("invalid scheduler options: random_lesson_skip_probability must lie in [0, 1]");
        }
        Ok(())
    }
}

impl Default for SchedulerOptions {
    /// Returns the default scheduler options.
    fn default() -> Self {
        SchedulerOptions {
            popsize: 200,
            num_parents: 50,
            num_offspring: 100,
            guaranteed_surviving_parents: 5,
            mutation_amount: 3,
            mutation_chance: 0.7,
            mutate_on_every_child: true,
            random_lesson_skip_probability: 0.2,
            seed_failure_threshold: 10,
            max_generations: 100,
            seed: None,
        }
    }
}

/// Options to control the daily driver.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct DriverOptions {
    /// The wall-clock time (UTC) at which the daily tick runs.
    pub tick_time: NaiveTime,

    /// The number of independent GA runs per day. The lowest-cost result wins.
    pub iterations: usize,

    /// The number of days ahead of today the driver considers for scheduling.
    pub look_ahead_period: u32,
}

impl DriverOptions {
    /// Verifies that the driver options are valid.
    pub fn verify(&self) -> Result<()> {
        if self.iterations < 1 {
            bail!("invalid driver options: iterations must be greater than 0");
        }
        if self.look_ahead_period < 1 {
            bail!("invalid driver options: look_ahead_period must be greater than 0");
        }
        Ok(())
    }
}

impl Default for DriverOptions {
    /// Returns the default driver options: a daily tick at 20:00 UTC, ten GA runs per day, and
    /// a two-week look-ahead window.
    fn default() -> Self {
        DriverOptions {
            tick_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            iterations: 10,
            look_ahead_period: 14,
        }
    }
}

/// The combined options of the crate, as loaded from a configuration file.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RotaOptions {
    /// The time discretization options.
    pub time: TimeOptions,

    /// The genetic algorithm options.
    pub scheduler: SchedulerOptions,

    /// The driver options.
    pub driver: DriverOptions,
}

impl RotaOptions {
    /// Verifies that all the options are valid.
    pub fn verify(&self) -> Result<()> {
        self.time.verify()?;
        self.scheduler.verify()?;
        self.driver.verify()
    }
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod test {
    use anyhow::Result;
    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;

    /// Verifies that the default options pass their own validation.
    #[test]
    fn default_options_are_valid() -> Result<()> {
        RotaOptions::default().verify()
    }

    /// Verifies the conversion from durations to whole time units.
    #[test]
    fn duration_units_floors() {
        let time = TimeOptions::default();
        assert_eq!(time.duration_units(TimeDelta::minutes(60)), 12);
        assert_eq!(time.duration_units(TimeDelta::seconds(299)), 0);
        assert_eq!(time.duration_units(TimeDelta::seconds(301)), 1);
        assert_eq!(time.duration_units(TimeDelta::seconds(-60)), 0);
    }

    /// Verifies the reconstruction of a placement's wall-clock start.
    #[test]
    fn lesson_start_arithmetic() {
        let time = TimeOptions::default();
        let first_day = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();

        // Day 0, unit 0 lands exactly at day start.
        assert_eq!(
            time.lesson_start(first_day, 0, 0),
            Utc.with_ymd_and_hms(2024, 3, 4, 8, 30, 0).unwrap()
        );

        // Day 2, unit 12 lands two days and one hour later.
        assert_eq!(
            time.lesson_start(first_day, 2, 12),
            Utc.with_ymd_and_hms(2024, 3, 6, 9, 30, 0).unwrap()
        );
    }

    /// Verifies that the largest valid relative start never underflows.
    #[test]
    fn max_start_saturates() {
        let time = TimeOptions::default();
        assert_eq!(time.max_start(12), 102);
        assert_eq!(time.max_start(500), 0);
    }

    /// Verifies that invalid time options are rejected.
    #[test]
    fn invalid_time_options() {
        let mut time = TimeOptions::default();
        time.seconds_per_unit = 0;
        assert!(time.verify().is_err());

        let mut time = TimeOptions::default();
        time.time_per_day = 0;
        assert!(time.verify().is_err());
    }

    /// Verifies that each invalid combination of scheduler options is rejected.
    #[test]
    fn invalid_scheduler_options() {
        let mut options = SchedulerOptions::default();
        options.popsize = 0;
        options.num_parents = 0;
        options.guaranteed_surviving_parents = 0;
        assert!(options.verify().is_err());

        let mut options = SchedulerOptions::default();
        options.num_parents = 0;
        assert!(options.verify().is_err());

        let mut options = SchedulerOptions::default();
        options.num_parents = options.popsize + 1;
        assert!(options.verify().is_err());

        let mut options = SchedulerOptions::default();
        options.guaranteed_surviving_parents = 0;
        assert!(options.verify().is_err());

        let mut options = SchedulerOptions::default();
        options.guaranteed_surviving_parents = options.num_parents + 1;
        assert!(options.verify().is_err());

        let mut options = SchedulerOptions::default();
        options.mutation_chance = 1.5;
        assert!(options.verify().is_err());

        let mut options = SchedulerOptions::default();
        options.random_lesson_skip_probability = -0.1;
        assert!(options.verify().is_err());
    }

    /// Verifies that invalid driver options are rejected.
    #[test]
    fn invalid_driver_options() {
        let mut options = DriverOptions::default();
        options.iterations = 0;
        assert!(options.verify().is_err());

        let mut options = DriverOptions::default();
        options.look_ahead_period = 0;
        assert!(options.verify().is_err());
    }

    /// Verifies that user types round-trip through their text representation.
    #[test]
    fn user_type_round_trip() -> Result<()> {
        assert_eq!(UserType::Teacher.to_string(), "teacher");
        assert_eq!("student".parse::<UserType>()?, UserType::Student);
        assert_eq!("admin".parse::<UserType>()?, UserType::Admin);
        Ok(())
    }

    /// Verifies that the combined options round-trip through their JSON configuration form and
    /// that a partial configuration falls back to the defaults.
    #[test]
    fn options_json_round_trip() -> Result<()> {
        let options = RotaOptions::default();
        let json = serde_json::to_string(&options)?;
        assert_eq!(serde_json::from_str::<RotaOptions>(&json)?, options);

        let partial: RotaOptions =
            serde_json::from_str(r#"{"scheduler": {"popsize": 50, "seed": 7}}"#)?;
        assert_eq!(partial.scheduler.popsize, 50);
        assert_eq!(partial.scheduler.seed, Some(7));
        assert_eq!(partial.scheduler.num_parents, 50);
        assert_eq!(partial.time, TimeOptions::default());
        Ok(())
    }
}
