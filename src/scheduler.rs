//! Defines the population of candidate timetables and the generation loop of the genetic
//! algorithm. This module is the core mechanism of how Rota turns a pool of unscheduled lessons
//! into a concrete timetable.
//!
//! One generation proceeds in three steps:
//! 1. The lowest-cost timetables are selected as parents.
//! 2. Offspring are produced by crossing over two parents drawn uniformly with replacement,
//!    then mutating every child.
//! 3. Survivors are chosen from the union of the old population and the offspring: the best
//!    few are carried forward unconditionally, and the rest are sampled randomly with an
//!    acceptance probability that falls with cost. The ratio-based acceptance avoids sorting
//!    the whole candidate set every generation while still biasing toward low-cost solutions;
//!    it is a rough, not exact, proportional sampler.

pub mod candidate;
pub mod data;
pub mod timetable;

use std::sync::Arc;

use rand::{Rng, seq::SliceRandom};
use rayon::prelude::*;
use tracing::debug;

use crate::{
    data::SchedulerOptions,
    driver::CancelToken,
    error::ScheduleError,
    scheduler::{data::SchedulerData, timetable::Timetable},
};

/// The hard cap on the number of generations, in case a custom stopping condition never
/// triggers.
const MAX_GENERATION_CAP: usize = 1000;

/// A pluggable stopping condition: given the population and the number of completed
/// generations, returns true to stop the run. The default stops after
/// `SchedulerOptions::max_generations`.
pub type StoppingCondition = Box<dyn Fn(&Population, usize) -> bool + Send + Sync>;

/// A fixed-size collection of timetables evolving toward a low-cost solution.
pub struct Population {
    /// The shared, read-only data of the run.
    data: Arc<SchedulerData>,

    /// The current timetables.
    timetables: Vec<Timetable>,

    /// The number of completed generations.
    generations: usize,

    /// The condition that ends the run.
    stopping_condition: StoppingCondition,
}

impl Population {
    /// Creates a new population of randomly seeded timetables. The scheduler options are
    /// validated before any timetable is allocated.
    pub fn new(data: Arc<SchedulerData>, rng: &mut impl Rng) -> Result<Population, ScheduleError> {
        data.options.verify().map_err(ScheduleError::Config)?;

        let max_generations = data.options.max_generations;
        let timetables = (0..data.options.popsize)
            .map(|_| Timetable::random(data.clone(), rng))
            .collect();
        Ok(Population {
            data,
            timetables,
            generations: 0,
            stopping_condition: Box::new(move |_, generations| generations >= max_generations),
        })
    }

    /// Replaces the stopping condition.
    #[must_use]
    pub fn with_stopping_condition(mut self, condition: StoppingCondition) -> Population {
        self.stopping_condition = condition;
        self
    }

    /// Returns the number of completed generations.
    #[must_use]
    pub fn generations(&self) -> usize {
        self.generations
    }

    /// Returns the current timetables.
    #[must_use]
    pub fn timetables(&self) -> &[Timetable] {
        &self.timetables
    }

    /// Evaluates the cost of every timetable that was modified since its last evaluation. Cost
    /// evaluation draws no randomness, so evaluating in parallel does not disturb the run's
    /// random stream.
    fn evaluate_costs(timetables: &mut [Timetable]) {
        timetables.par_iter_mut().for_each(|timetable| {
            timetable.cost();
        });
    }

    /// Runs the generation loop until the stopping condition triggers, checking for
    /// cancellation between generations. On cancellation the population is left with the best
    /// solutions found so far and an error is returned so the caller knows not to persist.
    pub fn run(
        &mut self,
        rng: &mut impl Rng,
        cancel: Option<&CancelToken>,
    ) -> Result<(), ScheduleError> {
        loop {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    Self::evaluate_costs(&mut self.timetables);
                    return Err(ScheduleError::Cancelled);
                }
            }
            if (self.stopping_condition)(self, self.generations)
                || self.generations >= MAX_GENERATION_CAP
            {
                break;
            }
            self.iterate(rng);
        }
        Self::evaluate_costs(&mut self.timetables);
        Ok(())
    }

    /// Performs one generation of the genetic algorithm on the current population.
    pub fn iterate(&mut self, rng: &mut impl Rng) {
        let options = self.data.options;
        Self::evaluate_costs(&mut self.timetables);

        // Select the lowest-cost timetables as parents.
        let mut order: Vec<usize> = (0..self.timetables.len()).collect();
        order.sort_by(|&a, &b| {
            let cost_a = self.timetables[a].cached_cost().unwrap_or(f64::INFINITY);
            let cost_b = self.timetables[b].cached_cost().unwrap_or(f64::INFINITY);
            cost_a.total_cmp(&cost_b)
        });
        let parents: Vec<&Timetable> = order
            .iter()
            .take(options.num_parents)
            .map(|&index| &self.timetables[index])
            .collect();

        // Produce the offspring: two parents drawn uniformly with replacement, crossover, then
        // mutation of every child (or a chance-gated mutation under the legacy setting).
        let mut offspring = Vec::with_capacity(options.num_offspring);
        for _ in 0..options.num_offspring {
            let first = parents[rng.random_range(0..parents.len())];
            let second = parents[rng.random_range(0..parents.len())];
            let mut child = first.crossover(second, rng);
            if options.mutate_on_every_child || rng.random_bool(options.mutation_chance) {
                child.mutate(rng);
            }
            offspring.push(child);
        }
        Self::evaluate_costs(&mut offspring);

        // Choose the next population from the union of the old population and the offspring.
        let mut candidates = std::mem::take(&mut self.timetables);
        candidates.extend(offspring);
        self.timetables = Self::choose_new_population(candidates, &options, rng);
        self.generations += 1;

        if let Some(best) = self.best() {
            debug!(
                generation = self.generations,
                best_cost = best.cached_cost(),
                "generation complete"
            );
        }
    }

    /// Chooses the new population from the candidates, whose costs must all be evaluated. The
    /// best few survive unconditionally; the rest are drawn at random, each at most once, and
    /// accepted with probability `1 - cost / Cmax` so that worse costs are rejected more
    /// often. If a full pass leaves the population short, the remaining slots are filled from
    /// the rejected candidates in draw order.
    fn choose_new_population(
        mut candidates: Vec<Timetable>,
        options: &SchedulerOptions,
        rng: &mut impl Rng,
    ) -> Vec<Timetable> {
        let max_cost = candidates
            .iter()
            .filter_map(Timetable::cached_cost)
            .fold(0.0f64, f64::max);

        // Carry forward the best solutions unconditionally.
        candidates.sort_by(|a, b| {
            let cost_a = a.cached_cost().unwrap_or(f64::INFINITY);
            let cost_b = b.cached_cost().unwrap_or(f64::INFINITY);
            cost_a.total_cmp(&cost_b)
        });
        let mut next: Vec<Timetable> = candidates
            .drain(..options.guaranteed_surviving_parents.min(candidates.len()))
            .collect();

        // If everything fits, no sampling is needed.
        if next.len() + candidates.len() <= options.popsize {
            next.extend(candidates);
            return next;
        }

        // Sample the remaining candidates in random order, each drawn at most once.
        candidates.shuffle(rng);
        let mut rejected = Vec::new();
        for timetable in candidates {
            if next.len() >= options.popsize {
                break;
            }
            let cost = timetable.cached_cost().unwrap_or(f64::INFINITY);
            let accept = max_cost <= 0.0 || rng.random_bool((1.0 - cost / max_cost).clamp(0.0, 1.0));
            if accept {
                next.push(timetable);
            } else {
                rejected.push(timetable);
            }
        }
        for timetable in rejected {
            if next.len() >= options.popsize {
                break;
            }
            next.push(timetable);
        }
        next
    }

    /// Returns the lowest-cost timetable of the current population. Timetables that have not
    /// been evaluated rank last.
    #[must_use]
    pub fn best(&self) -> Option<&Timetable> {
        self.timetables.iter().min_by(|a, b| {
            let cost_a = a.cached_cost().unwrap_or(f64::INFINITY);
            let cost_b = b.cached_cost().unwrap_or(f64::INFINITY);
            cost_a.total_cmp(&cost_b)
        })
    }

    /// Consumes the population and returns its lowest-cost timetable, evaluating any timetable
    /// that still needs it.
    #[must_use]
    pub fn into_best(mut self) -> Option<Timetable> {
        Self::evaluate_costs(&mut self.timetables);
        let best = self
            .timetables
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let cost_a = a.cached_cost().unwrap_or(f64::INFINITY);
                let cost_b = b.cached_cost().unwrap_or(f64::INFINITY);
                cost_a.total_cmp(&cost_b)
            })
            .map(|(index, _)| index)?;
        Some(self.timetables.swap_remove(best))
    }
}
