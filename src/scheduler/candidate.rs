//! Defines a lesson lifted out of the store for consideration in a scheduling run.

use chrono::TimeDelta;

use crate::{
    data::{GroupId, Lesson, LessonId, TimeOptions},
    error::ScheduleError,
};

/// An unscheduled lesson as the scheduler sees it: the persisted identity plus the duration in
/// whole time units and a mutable relative start.
///
/// A candidate carries no participant or teacher information of its own. That lives in the
/// per-group roster of the scheduler data, keyed by `group_id`, so cloning a candidate during
/// crossover copies a handful of words and the caches stay shared across the population.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateLesson {
    /// The ID of the persisted lesson this candidate was lifted from. Stable across the run and
    /// used to detect duplicate inclusion during crossover.
    pub id: LessonId,

    /// The ID of the group the lesson is taught to.
    pub group_id: GroupId,

    /// The topic of the lesson.
    pub topic: String,

    /// The persisted duration, written back unchanged when the timetable is committed.
    pub duration: TimeDelta,

    /// The number of whole time units the lesson spans.
    pub duration_units: u32,

    /// The offset of the placement from day start, in time units. Absent until the candidate is
    /// placed on a day.
    relative_start: Option<u32>,
}

impl CandidateLesson {
    /// Lifts a persisted lesson into a candidate. Returns a data error for lessons shorter than
    /// one time unit, which cannot occupy a slot and would disqualify their group's pool.
    pub fn from_lesson(lesson: &Lesson, time: &TimeOptions) -> Result<Self, ScheduleError> {
        let duration_units = time.duration_units(lesson.duration);
        if duration_units == 0 {
            return Err(ScheduleError::Data(
                lesson.group_id,
                format!(
                    "lesson with ID {} spans zero time units (duration {} s)",
                    lesson.id,
                    lesson.duration.num_seconds()
                ),
            ));
        }
        Ok(CandidateLesson {
            id: lesson.id,
            group_id: lesson.group_id,
            topic: lesson.topic.clone(),
            duration: lesson.duration,
            duration_units,
            relative_start: None,
        })
    }

    /// Returns the relative start of the placement, if the candidate has been placed.
    #[must_use]
    pub fn relative_start(&self) -> Option<u32> {
        self.relative_start
    }

    /// Returns the relative start of a placed candidate. Calling this on an unplaced candidate
    /// is a programming error, as is any placement outside the valid range.
    #[must_use]
    pub fn placed_start(&self) -> u32 {
        self.relative_start
            .expect("candidate in the placed set has no relative start")
    }

    /// Sets the relative start. Placements must lie in `[0, time_per_day - duration_units]`;
    /// anything else is a programming error in the caller.
    pub fn set_relative_start(&mut self, relative_start: u32, time: &TimeOptions) {
        assert!(
            relative_start <= time.max_start(self.duration_units),
            "relative start {relative_start} is out of range for a lesson spanning {} units",
            self.duration_units
        );
        self.relative_start = Some(relative_start);
    }

    /// Clears the relative start when the candidate is evicted back into the unscheduled pool.
    pub fn clear_relative_start(&mut self) {
        self.relative_start = None;
    }
}
