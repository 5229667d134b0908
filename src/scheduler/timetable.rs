//! Defines one candidate solution of the genetic algorithm: a placement of candidate lessons
//! onto the days of the run, the operators that seed, combine, and perturb it, and the cost
//! function that ranks it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use rand::{Rng, seq::SliceRandom};

use crate::{
    data::{GroupId, NewLesson, UserId, UserType},
    scheduler::{candidate::CandidateLesson, data::SchedulerData},
};

/// The cost of one clash in a teacher's schedule.
const TEACHER_CLASH_COST: f64 = 100.0;

/// The cost of one clash in a student's schedule.
const STUDENT_CLASH_COST: f64 = 10.0;

/// The weight and divisor of the even-allocation term.
const EVEN_ALLOCATION_WEIGHT: f64 = 100.0;
const EVEN_ALLOCATION_DIVISOR: f64 = 1000.0;

/// The offset and slope of the logistic ramp that phases the even-allocation term in as the
/// school year progresses.
const TERM_RAMP_OFFSET: f64 = -8.0;
const TERM_RAMP_SLOPE: f64 = 0.4;

/// The weight and base of the desired-volume term. Every unit of shortfall against the desired
/// daily lesson time per student multiplies the term by the base.
const DESIRED_VOLUME_WEIGHT: f64 = 25.0;
const DESIRED_VOLUME_BASE: f64 = 1.2;

/// The divisor of the variety term, and the cap on its exponent so that a group idle for years
/// keeps the term finite.
const VARIETY_DIVISOR: f64 = 1_000_000.0;
const VARIETY_EXPONENT_CAP: i64 = 52;

/// The scale of the daily-workload term. Acts as both the divisor of the occupied-slot count
/// and the threshold under which the term vanishes.
const WORKLOAD_SCALE: f64 = 23.0;

/// The last time unit a participant can occupy without incurring the late-finish penalty, and
/// the divisor converting the overshoot into cost.
const LATE_FINISH_UNIT: f64 = 48.0;
const LATE_FINISH_DIVISOR: f64 = 10.0;

/// A gap must exceed the lesson duration by this factor before the seeder samples an interior
/// start instead of packing the lesson against the gap's lower edge.
const MIN_BUFFER_FACTOR: f64 = 1.5;

/// Returns the cost of a gap of the given length between two consecutive placements. A spacing
/// of one unit is ideal; lengths two and three share the same penalty.
#[must_use]
pub fn gap_cost(length: u32) -> f64 {
    match length {
        0 => 10.0,
        2 | 3 => 5.0,
        4 => 1.0,
        _ => 0.0,
    }
}

/// The cached value of the cost function. Replaces the "uncomputed cost is infinite" sentinel
/// with an explicit tag; every operator that changes the timetable resets it to dirty.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Cost {
    /// The timetable has been modified since the cost was last computed.
    Dirty,

    /// The cost of the timetable as of the last computation.
    Cached(f64),
}

/// One candidate solution: an ordered set of placed lessons per day plus the residual pool of
/// candidates left unscheduled. Timetables exclusively own their candidates; the shared
/// per-group rosters live in the scheduler data.
#[derive(Clone, Debug)]
pub struct Timetable {
    /// The shared, read-only data of the run.
    data: Arc<SchedulerData>,

    /// The placed lessons of each day.
    days: Vec<Vec<CandidateLesson>>,

    /// The candidates not placed on any day. Disjoint from the placed sets by construction;
    /// mutation moves candidates between the two.
    unscheduled: Vec<CandidateLesson>,

    /// The cached cost.
    cost: Cost,
}

impl Timetable {
    /// Creates an empty timetable with every candidate in the unscheduled pool.
    #[must_use]
    pub fn new(data: Arc<SchedulerData>) -> Timetable {
        let days = vec![Vec::new(); data.days as usize];
        let unscheduled = data.candidates.clone();
        Timetable {
            data,
            days,
            unscheduled,
            cost: Cost::Dirty,
        }
    }

    /// Generates a random solution. The seeder is a greedy-randomized constructor rather than a
    /// uniform sampler: candidates are visited in shuffled order and dropped into the gaps of
    /// their teacher's day, biased toward start points that do not collide with what is already
    /// placed. After `seed_failure_threshold` consecutive candidates fail to find a gap, the
    /// remaining candidates are left unscheduled.
    #[must_use]
    pub fn random(data: Arc<SchedulerData>, rng: &mut impl Rng) -> Timetable {
        let time = data.time;
        let options = data.options;
        let mut timetable = Timetable::new(data.clone());

        // Visit the candidates in shuffled order, moving each from the pool onto a day when a
        // gap accepts it.
        let mut order = std::mem::take(&mut timetable.unscheduled);
        order.shuffle(rng);

        let mut failures = 0;
        let mut abandoned = false;
        for mut candidate in order {
            if abandoned {
                timetable.unscheduled.push(candidate);
                continue;
            }

            // Try the gaps of the teacher's day in random order.
            let day = rng.random_range(0..timetable.days.len());
            let teacher = data.teacher(candidate.group_id);
            let mut gaps = timetable.gaps(teacher, day as u32, true);
            gaps.shuffle(rng);

            let duration = candidate.duration_units;
            let mut chosen = None;
            for (start, length) in gaps {
                if rng.random_bool(options.random_lesson_skip_probability) {
                    continue;
                }
                if length > duration + 1 {
                    // Tight gaps pack the lesson one unit past the gap's lower edge; roomy gaps
                    // sample an interior start.
                    let relative_start = if (length as f64) < MIN_BUFFER_FACTOR * duration as f64 {
                        start + 1
                    } else {
                        rng.random_range(start..=start + length - 2 - duration)
                    };
                    chosen = Some(relative_start);
                    break;
                }
            }

            match chosen {
                Some(relative_start) => {
                    candidate.set_relative_start(relative_start, &time);
                    timetable.days[day].push(candidate);
                    failures = 0;
                }
                None => {
                    timetable.unscheduled.push(candidate);
                    failures += 1;
                    if failures >= options.seed_failure_threshold {
                        abandoned = true;
                    }
                }
            }
        }

        timetable
    }

    /// Returns the gaps of the given day as `(start, length)` pairs, where the length is the
    /// distance between the starts of consecutive placements. With `boundaries` set, the runs
    /// from day start to the first placement and from the last placement to the end of the day
    /// are included, and an empty day yields one gap spanning the whole day. Zero-length gaps
    /// are retained; the cost function penalizes them.
    fn day_gaps(lessons: &[CandidateLesson], time_per_day: u32, boundaries: bool) -> Vec<(u32, u32)> {
        let mut starts: Vec<u32> = lessons.iter().map(CandidateLesson::placed_start).collect();
        starts.sort_unstable();

        let Some((&first, _)) = starts.split_first() else {
            return if boundaries {
                vec![(0, time_per_day)]
            } else {
                Vec::new()
            };
        };

        let mut gaps = Vec::with_capacity(starts.len() + 1);
        if boundaries {
            gaps.push((0, first));
        }
        for pair in starts.windows(2) {
            gaps.push((pair[0], pair[1] - pair[0]));
        }
        if boundaries {
            let last = *starts.last().unwrap();
            gaps.push((last, time_per_day - last));
        }
        gaps
    }

    /// Returns the gaps of the given day for the given user. The gap list is derived from every
    /// placement of the day rather than from the user's personal schedule, so the same list is
    /// returned for every user; the parameter is kept for the day the projection is tightened.
    #[must_use]
    pub fn gaps(&self, _user: UserId, day: u32, boundaries: bool) -> Vec<(u32, u32)> {
        Self::day_gaps(
            &self.days[day as usize],
            self.data.time.time_per_day,
            boundaries,
        )
    }

    /// Produces one child from two parents. For each day, the parents' placements are merged,
    /// shuffled, and the first half taken, skipping entries whose lesson is already present on
    /// that day of the child. A lesson can still appear on two different days of the child;
    /// mutation and the cost function tolerate that, and the clash penalty weeds it out.
    #[must_use]
    pub fn crossover(&self, other: &Timetable, rng: &mut impl Rng) -> Timetable {
        let mut days: Vec<Vec<CandidateLesson>> = Vec::with_capacity(self.days.len());
        for (ours, theirs) in self.days.iter().zip(other.days.iter()) {
            let mut merged: Vec<&CandidateLesson> = ours.iter().chain(theirs.iter()).collect();
            merged.shuffle(rng);
            let take = merged.len() / 2;

            let mut day = Vec::with_capacity(take);
            let mut seen = HashSet::with_capacity(take);
            for lesson in merged.into_iter().take(take) {
                if seen.insert(lesson.id) {
                    day.push(lesson.clone());
                }
            }
            days.push(day);
        }

        // The child's residual pool is the master candidate list minus everything it placed.
        let placed: HashSet<_> = days.iter().flatten().map(|lesson| lesson.id).collect();
        let unscheduled = self
            .data
            .candidates
            .iter()
            .filter(|candidate| !placed.contains(&candidate.id))
            .cloned()
            .collect();

        Timetable {
            data: self.data.clone(),
            days,
            unscheduled,
            cost: Cost::Dirty,
        }
    }

    /// Mutates the timetable in place. For each day, `mutation_amount` operations are applied,
    /// each chosen uniformly from repositioning a placed lesson, evicting a placed lesson into
    /// the unscheduled pool, and injecting an unscheduled lesson onto the day. An operation on
    /// an empty list is a no-op.
    pub fn mutate(&mut self, rng: &mut impl Rng) {
        let time = self.data.time;
        let amount = self.data.options.mutation_amount;
        for day in 0..self.days.len() {
            for _ in 0..amount {
                match rng.random_range(0..3) {
                    0 => {
                        // Reposition a placed lesson.
                        let lessons = &mut self.days[day];
                        if lessons.is_empty() {
                            continue;
                        }
                        let index = rng.random_range(0..lessons.len());
                        let max_start = time.max_start(lessons[index].duration_units);
                        let relative_start = rng.random_range(0..=max_start);
                        lessons[index].set_relative_start(relative_start, &time);
                    }
                    1 => {
                        // Evict a placed lesson into the unscheduled pool. Crossover can leave
                        // a copy of the same lesson on another day; evicting such a copy drops
                        // it instead of pooling it, keeping the placed and unscheduled pools
                        // disjoint.
                        if self.days[day].is_empty() {
                            continue;
                        }
                        let index = rng.random_range(0..self.days[day].len());
                        let mut lesson = self.days[day].remove(index);
                        lesson.clear_relative_start();
                        if self.days.iter().flatten().any(|placed| placed.id == lesson.id) {
                            continue;
                        }
                        let position = rng.random_range(0..=self.unscheduled.len());
                        self.unscheduled.insert(position, lesson);
                    }
                    _ => {
                        // Inject an unscheduled lesson onto this day. The pool never holds an
                        // ID that is also placed, so the day cannot end up with a duplicate.
                        if self.unscheduled.is_empty() {
                            continue;
                        }
                        let index = rng.random_range(0..self.unscheduled.len());
                        let mut lesson = self.unscheduled.remove(index);
                        let max_start = time.max_start(lesson.duration_units);
                        lesson.set_relative_start(rng.random_range(0..=max_start), &time);
                        self.days[day].push(lesson);
                    }
                }
            }
        }
        self.cost = Cost::Dirty;
    }

    /// Returns the cost of the timetable, recomputing it only if the timetable was modified
    /// since the last computation. Lower is better.
    pub fn cost(&mut self) -> f64 {
        if let Cost::Cached(cost) = self.cost {
            return cost;
        }
        self.recompute_cost()
    }

    /// Recomputes the cost of the timetable unconditionally and refreshes the cache.
    pub fn recompute_cost(&mut self) -> f64 {
        let cost = self.compute_cost();
        self.cost = Cost::Cached(cost);
        cost
    }

    /// Returns the cached cost, if the timetable has not been modified since it was computed.
    #[must_use]
    pub fn cached_cost(&self) -> Option<f64> {
        match self.cost {
            Cost::Dirty => None,
            Cost::Cached(cost) => Some(cost),
        }
    }

    /// Evaluates the composite cost function: the sum over days of the clash, even-allocation,
    /// desired-volume, variety, daily-workload, gap, and late-finish terms.
    fn compute_cost(&self) -> f64 {
        let data = &self.data;
        let time = &data.time;

        // The logistic ramp phasing the even-allocation term in over the first weeks of the
        // school year.
        let elapsed_days = (data.first_day - data.year_start).num_days() as f64;
        let ramp = logistic(TERM_RAMP_OFFSET + TERM_RAMP_SLOPE * elapsed_days);

        let mut total = 0.0;
        for lessons in &self.days {
            // Accumulate the occupied time units of every participant, counting clashes as
            // attempts to occupy a unit twice. Units are only ever inserted once.
            let mut schedules: BTreeMap<UserId, (UserType, BTreeSet<u32>)> = BTreeMap::new();
            let mut placed_secs: BTreeMap<GroupId, i64> = BTreeMap::new();
            let mut teacher_clashes = 0u64;
            let mut student_clashes = 0u64;
            for lesson in lessons {
                let start = lesson.placed_start();
                *placed_secs.entry(lesson.group_id).or_insert(0) += lesson.duration.num_seconds();
                for (user_id, user_type) in data.participants(lesson.group_id) {
                    let (_, schedule) = schedules
                        .entry(*user_id)
                        .or_insert_with(|| (*user_type, BTreeSet::new()));
                    for unit in start..start + lesson.duration_units {
                        if !schedule.insert(unit) {
                            if *user_type == UserType::Teacher {
                                teacher_clashes += 1;
                            } else {
                                student_clashes += 1;
                            }
                        }
                    }
                }
            }

            // Clashes.
            total += TEACHER_CLASH_COST * teacher_clashes as f64
                + STUDENT_CLASH_COST * student_clashes as f64;

            // Even allocation: deviation of each group's running total (history plus this day)
            // from the cross-group mean, phased in by the term ramp.
            if !data.stats.is_empty() {
                let allocated: Vec<f64> = data
                    .stats
                    .iter()
                    .map(|(group_id, stats)| {
                        (stats.allocated_secs + placed_secs.get(group_id).copied().unwrap_or(0))
                            as f64
                    })
                    .collect();
                let desired = allocated.iter().sum::<f64>() / allocated.len() as f64;
                if desired > 0.0 {
                    let deviation: f64 =
                        allocated.iter().map(|a| (a - desired).abs() / desired).sum();
                    total += EVEN_ALLOCATION_WEIGHT * ramp * deviation / EVEN_ALLOCATION_DIVISOR;
                }
            }

            // Desired volume: exponential pressure toward the desired daily lesson time per
            // student.
            let student_units: usize = schedules
                .values()
                .filter(|(user_type, _)| *user_type == UserType::Student)
                .map(|(_, schedule)| schedule.len())
                .sum();
            let average = if data.num_students > 0 {
                student_units as f64 / data.num_students as f64
            } else {
                0.0
            };
            total += DESIRED_VOLUME_WEIGHT
                * DESIRED_VOLUME_BASE.powf(f64::from(time.desired_lesson_time) - average);

            // Variety: groups that have not met for a long time dominate; a group placed on
            // this day counts as just seen.
            if !data.stats.is_empty() {
                let sum: f64 = data
                    .stats
                    .iter()
                    .map(|(group_id, stats)| {
                        let days_since = if placed_secs.contains_key(group_id) {
                            0
                        } else {
                            stats.days_since_last.clamp(0, VARIETY_EXPONENT_CAP)
                        };
                        2f64.powi(days_since as i32)
                    })
                    .sum();
                total += sum / (VARIETY_DIVISOR * data.stats.len() as f64);
            }

            // Daily workload: an exponential penalty once a participant's day fills up.
            for (_, schedule) in schedules.values() {
                let load = (schedule.len() as f64 / WORKLOAD_SCALE).exp() - WORKLOAD_SCALE;
                if load > 0.0 {
                    total += load;
                }
            }

            // Gaps: the day's interior gap cost, incurred once per participant. The gap list is
            // user-independent, so it is computed once and weighted by the participant count.
            let day_gap_cost: f64 = Self::day_gaps(lessons, time.time_per_day, false)
                .into_iter()
                .map(|(_, length)| gap_cost(length))
                .sum();
            total += day_gap_cost * schedules.len() as f64;

            // Late finish: a linear penalty on the last occupied unit past the early-finish
            // mark.
            for (_, schedule) in schedules.values() {
                if let Some(last) = schedule.last() {
                    let overshoot = (f64::from(*last) - LATE_FINISH_UNIT) / LATE_FINISH_DIVISOR;
                    if overshoot > 0.0 {
                        total += overshoot;
                    }
                }
            }
        }

        total.max(0.0)
    }

    /// Returns the rows to insert when this timetable is committed: one fixed lesson per placed
    /// candidate, with the wall-clock start reconstructed from the placement.
    #[must_use]
    pub fn lesson_rows(&self) -> Vec<NewLesson> {
        let mut rows = Vec::with_capacity(self.num_placed());
        for (day, lessons) in self.days.iter().enumerate() {
            for lesson in lessons {
                rows.push(NewLesson {
                    group_id: lesson.group_id,
                    duration: lesson.duration,
                    topic: lesson.topic.clone(),
                    start: Some(self.data.time.lesson_start(
                        self.data.first_day,
                        day as u32,
                        lesson.placed_start(),
                    )),
                    fixed: true,
                });
            }
        }
        rows
    }

    /// Returns the shared data of the run.
    #[must_use]
    pub fn data(&self) -> &Arc<SchedulerData> {
        &self.data
    }

    /// Returns the number of days covered by the timetable.
    #[must_use]
    pub fn num_days(&self) -> u32 {
        self.days.len() as u32
    }

    /// Returns the placed lessons of the given day.
    #[must_use]
    pub fn day(&self, day: u32) -> &[CandidateLesson] {
        &self.days[day as usize]
    }

    /// Returns the candidates left unscheduled.
    #[must_use]
    pub fn unscheduled(&self) -> &[CandidateLesson] {
        &self.unscheduled
    }

    /// Returns the total number of placed lessons across all days.
    #[must_use]
    pub fn num_placed(&self) -> usize {
        self.days.iter().map(Vec::len).sum()
    }
}

/// The logistic function.
fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
