//! Defines the data used by the scheduler and the snapshot logic that reads it from the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    data::{GroupId, GroupStats, SchedulerOptions, TimeOptions, UserId, UserType},
    error::ScheduleError,
    scheduler::candidate::CandidateLesson,
    store::TimetableStore,
};

/// The roster of one group with candidates in the current run: its teacher and every linked
/// user, resolved once when the snapshot is taken and shared by every timetable.
#[derive(Clone, Debug)]
pub struct GroupRoster {
    /// The ID of the group's teacher.
    pub teacher: UserId,

    /// Every user linked to the group, with their type. These are the participants of the
    /// group's lessons.
    pub participants: Vec<(UserId, UserType)>,
}

/// A struct encapsulating all the state a scheduling run works from. The snapshot is taken once
/// at the start of the run; the genetic algorithm itself never touches the store.
#[derive(Clone, Debug)]
pub struct SchedulerData {
    /// The options used to run this scheduler.
    pub options: SchedulerOptions,

    /// The time discretization options.
    pub time: TimeOptions,

    /// The number of days covered by each timetable.
    pub days: u32,

    /// The midnight of the first day covered by the run.
    pub first_day: DateTime<Utc>,

    /// The reference point for term-progress weighting in the cost function.
    pub year_start: DateTime<Utc>,

    /// The pool of candidates eligible for placement, at most `days` per group.
    pub candidates: Vec<CandidateLesson>,

    /// The rosters of the groups with candidates in the pool, keyed by group ID.
    pub rosters: BTreeMap<GroupId, GroupRoster>,

    /// The scheduling history of every group, with or without candidates.
    pub stats: BTreeMap<GroupId, GroupStats>,

    /// The number of distinct students across all groups, used to average the daily lesson
    /// volume per student.
    pub num_students: usize,
}

impl SchedulerData {
    /// Reads a snapshot from the store. Groups whose data cannot support scheduling (no
    /// teacher, or a lesson spanning zero time units) are disqualified from the run with a
    /// warning; the run proceeds without them and retries them naturally on the next tick.
    pub fn fetch(
        store: &dyn TimetableStore,
        options: SchedulerOptions,
        time: TimeOptions,
        days: u32,
        first_day: DateTime<Utc>,
        year_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SchedulerData, ScheduleError> {
        let lessons = store.unscheduled_lessons(first_day, days as usize)?;
        let stats = store.group_statistics(now)?;

        // Resolve the roster of every group in the pool, disqualifying groups without a
        // teacher.
        let group_ids: BTreeSet<GroupId> = lessons.iter().map(|lesson| lesson.group_id).collect();
        let mut rosters = BTreeMap::new();
        for group_id in group_ids {
            let Some(teacher) = store.teacher_of_group(group_id)? else {
                warn!(group_id, "group has no teacher; skipping its lessons for this run");
                continue;
            };
            let participants = store
                .users_of_group(group_id)?
                .into_iter()
                .map(|user| (user.id, user.user_type))
                .collect();
            rosters.insert(
                group_id,
                GroupRoster {
                    teacher: teacher.id,
                    participants,
                },
            );
        }

        // Lift the remaining lessons into candidates. A zero-unit lesson disqualifies its whole
        // group.
        let mut candidates = Vec::with_capacity(lessons.len());
        for lesson in &lessons {
            if !rosters.contains_key(&lesson.group_id) {
                continue;
            }
            match CandidateLesson::from_lesson(lesson, &time) {
                Ok(candidate) => candidates.push(candidate),
                Err(error) => {
                    warn!(group_id = lesson.group_id, %error, "skipping group for this run");
                    let group_id = lesson.group_id;
                    rosters.remove(&group_id);
                    candidates.retain(|candidate| candidate.group_id != group_id);
                }
            }
        }

        // Count the distinct students across every group in the statistics map.
        let mut student_ids = BTreeSet::new();
        for group_id in stats.keys() {
            for student in store.students_of_group(*group_id)? {
                student_ids.insert(student.id);
            }
        }

        Ok(SchedulerData {
            options,
            time,
            days,
            first_day,
            year_start,
            candidates,
            rosters,
            stats,
            num_students: student_ids.len(),
        })
    }

    /// Returns the ID of the teacher of the given group. Only groups with candidates in the
    /// pool carry a roster; asking for any other group is a programming error.
    #[must_use]
    pub fn teacher(&self, group_id: GroupId) -> UserId {
        self.roster(group_id).teacher
    }

    /// Returns the participants of the given group's lessons.
    #[must_use]
    pub fn participants(&self, group_id: GroupId) -> &[(UserId, UserType)] {
        &self.roster(group_id).participants
    }

    /// Returns the roster of the given group.
    #[must_use]
    fn roster(&self, group_id: GroupId) -> &GroupRoster {
        self.rosters
            .get(&group_id)
            .expect("no roster for a group with placed candidates")
    }
}
