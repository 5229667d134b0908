//! Defines the daily driver: the service that decides which upcoming days still need a
//! timetable, runs the genetic algorithm for each, and commits the winning timetable.
//!
//! The driver replaces the process-wide periodic task of old with an explicit service: the
//! clock is injected so tests can pin time, runs are serialized behind a lock, and a cancel
//! token is honored between generations and between days, never mid-evaluation.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info, warn};

use crate::{
    data::{NewLesson, RotaOptions, midnight},
    error::ScheduleError,
    scheduler::{Population, data::SchedulerData, timetable::Timetable},
    store::TimetableStore,
};

/// The topic of the placeholder lessons the feeder creates after a successful run, so that the
/// unscheduled pool never runs dry during development.
pub const FEEDER_TOPIC: &str = "Automatically generated while timetabling";

/// The bounds of the feeder lessons' duration, in seconds.
const FEEDER_MIN_SECS: i64 = 6 * 300;
const FEEDER_MAX_SECS: i64 = 24 * 300;

/// A signal to stop a scheduling run from outside. Cancellation is observed between
/// generations and between days; the best solution found so far is kept but never persisted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a new, unset token.
    #[must_use]
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A source of wall-clock time. Production uses [SystemClock]; tests inject a fixed clock to
/// pin the driver to a known day.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The daily driver. Once per day it walks the look-ahead window, schedules every weekday that
/// has no fixed lessons yet, and commits the lowest-cost timetable found for each.
pub struct Driver {
    /// The store the driver reads snapshots from and commits timetables to.
    store: Arc<RwLock<dyn TimetableStore>>,

    /// The combined options of the crate.
    options: RotaOptions,

    /// The source of wall-clock time.
    clock: Arc<dyn Clock>,

    /// Serializes driver runs; two concurrent ticks must never interleave their store
    /// transactions.
    run_lock: Mutex<()>,
}

impl Driver {
    /// Creates a new driver. Configuration errors are fatal here, before any run starts.
    pub fn new(
        store: Arc<RwLock<dyn TimetableStore>>,
        options: RotaOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Driver, ScheduleError> {
        options.verify().map_err(ScheduleError::Config)?;
        Ok(Driver {
            store,
            options,
            clock,
            run_lock: Mutex::new(()),
        })
    }

    /// Performs one driver tick: for each weekday in the look-ahead window with no fixed
    /// lessons yet, runs the scheduler and commits the winning timetable. Returns the number
    /// of days that received a timetable. Weekends and days that already have lessons are
    /// skipped; a day whose commit fails aborts the tick and is retried naturally on the next
    /// one, since the unscheduled pool is unchanged.
    pub fn tick(&self, cancel: &CancelToken) -> Result<usize, ScheduleError> {
        let _guard = self.run_lock.lock();
        let now = self.clock.now();
        let today = midnight(now);
        let mut rng = match self.options.scheduler.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut scheduled_days = 0;
        for offset in 0..self.options.driver.look_ahead_period {
            if cancel.is_cancelled() {
                return Err(ScheduleError::Cancelled);
            }

            let day = today + TimeDelta::days(i64::from(offset));
            if day.weekday().num_days_from_monday() > 4 {
                continue;
            }
            if self
                .store
                .read()
                .has_lesson_between(day, day + TimeDelta::days(1))?
            {
                debug!(day = %day.date_naive(), "day already has lessons; skipping");
                continue;
            }

            if self.schedule_day(day, today, now, &mut rng, Some(cancel))? {
                scheduled_days += 1;
            }
        }
        Ok(scheduled_days)
    }

    /// Schedules a single day: reads a snapshot, runs the genetic algorithm `iterations`
    /// times, and commits the lowest-cost result together with the feeder lessons. Returns
    /// whether a timetable was committed.
    pub fn schedule_day(
        &self,
        first_day: DateTime<Utc>,
        year_start: DateTime<Utc>,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
        cancel: Option<&CancelToken>,
    ) -> Result<bool, ScheduleError> {
        // Snapshot the store. A store error here aborts the whole run.
        let data = {
            let store = self.store.read();
            Arc::new(SchedulerData::fetch(
                &*store,
                self.options.scheduler,
                self.options.time,
                1,
                first_day,
                year_start,
                now,
            )?)
        };
        if data.candidates.is_empty() {
            debug!(day = %first_day.date_naive(), "no candidates to schedule");
            return Ok(false);
        }

        // Keep the lowest-cost result over the configured number of independent runs.
        let mut best: Option<Timetable> = None;
        for _ in 0..self.options.driver.iterations {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(ScheduleError::Cancelled);
                }
            }
            let mut population = Population::new(data.clone(), rng)?;
            population.run(rng, cancel)?;
            if let Some(candidate) = population.into_best() {
                let better = match &best {
                    None => true,
                    Some(current) => {
                        candidate.cached_cost().unwrap_or(f64::INFINITY)
                            < current.cached_cost().unwrap_or(f64::INFINITY)
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }

        let Some(best) = best else {
            return Ok(false);
        };
        let rows = best.lesson_rows();
        if rows.is_empty() {
            debug!(day = %first_day.date_naive(), "best timetable placed nothing");
            return Ok(false);
        }

        // Commit the winning timetable, then feed the pool with placeholder lessons for the
        // groups that were just scheduled.
        self.store.write().add_lessons(&rows)?;
        let feeders: Vec<NewLesson> = rows
            .iter()
            .map(|row| NewLesson {
                group_id: row.group_id,
                duration: TimeDelta::seconds(rng.random_range(FEEDER_MIN_SECS..=FEEDER_MAX_SECS)),
                topic: FEEDER_TOPIC.into(),
                start: None,
                fixed: false,
            })
            .collect();
        self.store.write().add_lessons(&feeders)?;

        info!(
            day = %first_day.date_naive(),
            lessons = rows.len(),
            cost = best.cached_cost(),
            "timetable committed"
        );
        Ok(true)
    }

    /// Runs the driver until cancelled, ticking once per day at the configured time. Blocking
    /// call; run it on its own thread.
    pub fn run_loop(&self, cancel: &CancelToken) {
        info!("driver loop started");
        while !cancel.is_cancelled() {
            let next = next_tick(self.clock.now(), self.options.driver.tick_time);
            while self.clock.now() < next {
                if cancel.is_cancelled() {
                    return;
                }
                thread::sleep(Duration::from_secs(1));
            }

            match self.tick(cancel) {
                Ok(days) => info!(days, "driver tick complete"),
                Err(ScheduleError::Cancelled) => return,
                Err(error) => warn!(%error, "driver tick failed; will retry on the next tick"),
            }
        }
    }
}

/// Returns the next instant at or after `now` whose wall-clock time is `tick_time`.
fn next_tick(now: DateTime<Utc>, tick_time: NaiveTime) -> DateTime<Utc> {
    let candidate = midnight(now) + tick_time.signed_duration_since(NaiveTime::MIN);
    if candidate > now {
        candidate
    } else {
        candidate + TimeDelta::days(1)
    }
}
