//! The runner: drives a test function over the buffer space.
//!
//! A run moves through three phases. Reuse replays previously failing buffers
//! from the database. Generation asks the prefix tree for novel buffers until
//! a budget runs out, the space is exhausted, or failures have been found.
//! Shrinking then minimizes each distinct failure origin to a
//! shortlex-minimal buffer, persisting progress as it goes.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::data::{ConjectureData, ConjectureResult, Status, StopTest};
use crate::database::{DatabaseError, DatabaseKey, ExampleDatabase};
use crate::datatree::{DataTree, TreeRecordingObserver};
use crate::shrinking::{sort_key, Shrinker};

/// Which stages of a run to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reuse,
    Generate,
    Shrink,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    MaxExamples,
    MaxIterations,
    MaxShrinks,
    Finished,
    Flaky,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheck {
    TooSlow,
    FilterTooMuch,
    DataTooLarge,
    LargeBaseExample,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("health check failed ({check:?}): {message}")]
    FailedHealthCheck { check: HealthCheck, message: String },

    #[error("flaky test: {0}")]
    Flaky(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Control-flow signal for ending a run early from deep inside a phase.
pub(crate) enum Interrupt {
    Exit(ExitReason),
    Error(EngineError),
}

pub(crate) type TestFn<'t> = dyn FnMut(&mut ConjectureData) -> Result<(), StopTest> + 't;

/// Per-run settings. Everything that production code might want to tune is a
/// field here rather than a global.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Stop generating once this many valid examples have run.
    pub max_examples: usize,
    /// Stop shrinking after this many accepted shrinks.
    pub max_shrinks: usize,
    /// Keep generating for a short while after the first failure, looking
    /// for distinct failures.
    pub min_test_calls: usize,
    /// Hard ceiling on bytes per test case.
    pub buffer_size: usize,
    /// Bound on the outcome cache.
    pub cache_size: usize,
    pub seed: u64,
    pub phases: Vec<Phase>,
    /// When false, stop generating as soon as any failure is known.
    pub report_multiple_bugs: bool,
    pub suppress_health_checks: bool,
    /// A single test call slower than this fails the TooSlow health check.
    pub slow_call_threshold: Duration,
    /// Wall-clock bound for the whole run.
    pub max_time: Option<Duration>,
    /// Log one line per executed test case.
    pub verbose: bool,
    pub database_key: Option<DatabaseKey>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            max_examples: 100,
            max_shrinks: 500,
            min_test_calls: 10,
            buffer_size: 8 * 1024,
            cache_size: 50_000,
            seed: 0,
            phases: vec![Phase::Reuse, Phase::Generate, Phase::Shrink],
            report_multiple_bugs: true,
            suppress_health_checks: false,
            slow_call_threshold: Duration::from_secs(1),
            max_time: None,
            verbose: false,
            database_key: None,
        }
    }
}

/// Counters and outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    pub call_count: usize,
    pub valid_examples: usize,
    pub invalid_examples: usize,
    pub overruns: usize,
    /// Accepted shrinks: times a known failure was replaced by a strictly
    /// shortlex-smaller one.
    pub shrinks: usize,
    pub event_counts: HashMap<String, usize>,
    pub exit_reason: Option<ExitReason>,
}

/// Bounded outcome cache keyed by buffer. Eviction is least-recently-used,
/// tracked with a monotonic stamp per entry.
struct LruCache {
    capacity: usize,
    stamp: u64,
    map: HashMap<Vec<u8>, (u64, ConjectureResult)>,
    order: BTreeMap<u64, Vec<u8>>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        LruCache {
            capacity: capacity.max(1),
            stamp: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<ConjectureResult> {
        self.stamp += 1;
        let stamp = self.stamp;
        let entry = self.map.get_mut(key)?;
        self.order.remove(&entry.0);
        entry.0 = stamp;
        self.order.insert(stamp, key.to_vec());
        Some(entry.1.clone())
    }

    fn insert(&mut self, key: Vec<u8>, value: ConjectureResult) {
        self.stamp += 1;
        let stamp = self.stamp;
        if let Some((old_stamp, _)) = self.map.get(&key) {
            self.order.remove(old_stamp);
        } else if self.map.len() >= self.capacity {
            let oldest = self.order.iter().next().map(|(&s, k)| (s, k.clone()));
            if let Some((s, k)) = oldest {
                self.order.remove(&s);
                self.map.remove(&k);
            }
        }
        self.order.insert(stamp, key.clone());
        self.map.insert(key, (stamp, value));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Drives one test function to completion: generation, failure dedup by
/// origin, shrinking, persistence.
pub struct ConjectureRunner {
    config: RunnerConfig,
    stats: RunnerStats,
    rng: ChaCha8Rng,
    tree: Rc<RefCell<DataTree>>,
    cache: LruCache,
    interesting: BTreeMap<u64, ConjectureResult>,
    database: Option<Box<dyn ExampleDatabase>>,
    started: Instant,
}

impl ConjectureRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let cache = LruCache::new(config.cache_size);
        ConjectureRunner {
            config,
            stats: RunnerStats::default(),
            rng,
            tree: Rc::new(RefCell::new(DataTree::new())),
            cache,
            interesting: BTreeMap::new(),
            database: None,
            started: Instant::now(),
        }
    }

    pub fn with_database(mut self, database: Box<dyn ExampleDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.stats.exit_reason
    }

    /// The shortlex-best known failure per origin.
    pub fn interesting_examples(&self) -> &BTreeMap<u64, ConjectureResult> {
        &self.interesting
    }

    pub fn database(&self) -> Option<&dyn ExampleDatabase> {
        self.database.as_deref()
    }

    /// Run the whole search. On success the failures found (if any) are in
    /// [`interesting_examples`](Self::interesting_examples); fatal conditions
    /// (health check failures, flakiness, database errors) return an error.
    pub fn run<F>(&mut self, mut test: F) -> Result<(), EngineError>
    where
        F: FnMut(&mut ConjectureData) -> Result<(), StopTest>,
    {
        self.started = Instant::now();
        let test: &mut TestFn<'_> = &mut test;
        let outcome = self.run_phases(test);
        match outcome {
            Ok(()) => {
                self.stats.exit_reason = Some(ExitReason::Finished);
            }
            Err(Interrupt::Exit(reason)) => {
                self.stats.exit_reason = Some(reason);
            }
            Err(Interrupt::Error(e)) => {
                self.stats.exit_reason = Some(match e {
                    EngineError::Flaky(_) => ExitReason::Flaky,
                    _ => ExitReason::Interrupted,
                });
                return Err(e);
            }
        }
        // Shrink bookkeeping in the secondary key is only settled when the
        // shrink phase was allowed to finish.
        if matches!(
            self.stats.exit_reason,
            Some(ExitReason::Finished) | Some(ExitReason::MaxExamples) | Some(ExitReason::MaxIterations)
        ) {
            match self.clear_secondary_key(test) {
                Ok(()) | Err(Interrupt::Exit(_)) => {}
                Err(Interrupt::Error(e)) => return Err(e),
            }
        }
        debug!(
            calls = self.stats.call_count,
            valid = self.stats.valid_examples,
            shrinks = self.stats.shrinks,
            exit = ?self.stats.exit_reason,
            "run complete"
        );
        Ok(())
    }

    fn run_phases(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        if self.config.phases.contains(&Phase::Reuse) {
            self.reuse_existing_examples(test)?;
        }
        if self.config.phases.contains(&Phase::Generate) {
            self.generate_new_examples(test)?;
        }
        if self.config.phases.contains(&Phase::Shrink) {
            self.shrink_interesting_examples(test)?;
        }
        Ok(())
    }

    fn max_calls(&self) -> usize {
        (self.config.max_examples * 10).max(1000)
    }

    fn should_generate_more(&self) -> bool {
        if self.stats.valid_examples >= self.config.max_examples {
            return false;
        }
        if self.stats.call_count >= self.max_calls() {
            return false;
        }
        if self.interesting.is_empty() {
            return true;
        }
        if !self.config.report_multiple_bugs {
            return false;
        }
        // Briefly keep looking for failures with a different origin.
        self.stats.call_count < self.config.min_test_calls
    }

    fn reuse_existing_examples(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let key = match &self.config.database_key {
            Some(k) => k.clone(),
            None => return Ok(()),
        };
        let db = match self.database.as_deref() {
            Some(db) => db,
            None => return Ok(()),
        };
        let mut corpus = db.fetch(&key).map_err(db_interrupt)?;
        corpus.extend(db.fetch(&key.secondary()).map_err(db_interrupt)?);
        corpus.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        corpus.dedup();
        for buffer in corpus {
            let result = self.cached_test_function(&buffer, test)?;
            if result.status != Status::Interesting {
                if let Some(db) = self.database.as_deref_mut() {
                    db.delete(&key, &buffer).map_err(db_interrupt)?;
                    db.delete(&key.secondary(), &buffer).map_err(db_interrupt)?;
                }
            }
        }
        Ok(())
    }

    fn generate_new_examples(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        if !self.should_generate_more() {
            return Ok(());
        }
        // The all-zeros buffer is the base example everything shrinks
        // towards; if even that is unworkable the test is not going to get
        // useful coverage.
        let zero = self.cached_test_function(&vec![0u8; self.config.buffer_size], test)?;
        if !self.config.suppress_health_checks && self.interesting.is_empty() {
            if zero.status == Status::Overrun
                || (zero.status == Status::Valid
                    && zero.buffer.len() * 2 > self.config.buffer_size)
            {
                return Err(health_check(
                    HealthCheck::LargeBaseExample,
                    format!(
                        "the minimal example consumes {} of {} buffer bytes",
                        zero.buffer.len(),
                        self.config.buffer_size
                    ),
                ));
            }
        }

        while self.should_generate_more() {
            if self.tree.borrow().is_exhausted() {
                break;
            }
            let prefix = self.tree.borrow().generate_novel_prefix(&mut self.rng);
            debug_assert!(prefix.len() <= self.config.buffer_size);
            let seed = self.rng.gen();
            let observer = TreeRecordingObserver::new(Rc::clone(&self.tree));
            let data = ConjectureData::for_prefix(prefix, seed, self.config.buffer_size)
                .with_observer(Box::new(observer));
            let result = self.test_function(data, test)?;
            self.cache.insert(result.buffer.clone(), result);
            self.generation_health_checks()?;
        }
        if self.interesting.is_empty() {
            if self.stats.valid_examples >= self.config.max_examples {
                return Err(Interrupt::Exit(ExitReason::MaxExamples));
            }
            if self.stats.call_count >= self.max_calls() {
                return Err(Interrupt::Exit(ExitReason::MaxIterations));
            }
        }
        Ok(())
    }

    fn generation_health_checks(&self) -> Result<(), Interrupt> {
        if self.config.suppress_health_checks || !self.interesting.is_empty() {
            return Ok(());
        }
        let s = &self.stats;
        if s.invalid_examples >= 50 && s.valid_examples * 10 < s.invalid_examples {
            return Err(health_check(
                HealthCheck::FilterTooMuch,
                format!(
                    "only {} of {} examples were valid",
                    s.valid_examples, s.call_count
                ),
            ));
        }
        if s.overruns >= 20 && s.valid_examples * 10 < s.overruns {
            return Err(health_check(
                HealthCheck::DataTooLarge,
                format!("{} of {} examples overran the buffer", s.overruns, s.call_count),
            ));
        }
        Ok(())
    }

    fn shrink_interesting_examples(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let mut targets: Vec<u64> = self.interesting.keys().copied().collect();
        targets.sort_by(|a, b| {
            sort_key(&self.interesting[a].buffer).cmp(&sort_key(&self.interesting[b].buffer))
        });
        for origin in targets {
            let example = self.interesting[&origin].clone();
            // Confirm the failure still reproduces before spending budget on
            // it. The cache is deliberately bypassed here.
            let observer = TreeRecordingObserver::new(Rc::clone(&self.tree));
            let data =
                ConjectureData::for_buffer(&example.buffer).with_observer(Box::new(observer));
            let replay = self.test_function(data, test)?;
            if replay.status != Status::Interesting || replay.origin != Some(origin) {
                return Err(Interrupt::Error(EngineError::Flaky(format!(
                    "buffer {:?} failed with origin {} but now gives {}",
                    example.buffer, origin, replay.status
                ))));
            }
            Shrinker::new(self, origin, example).shrink(test)?;
        }
        Ok(())
    }

    /// Re-check leftover shrink intermediates and then drop them. Anything
    /// not smaller than the surviving minima is stale; anything smaller gets
    /// one more chance to reproduce before being removed.
    fn clear_secondary_key(&mut self, test: &mut TestFn<'_>) -> Result<(), Interrupt> {
        let key = match &self.config.database_key {
            Some(k) => k.clone(),
            None => return Ok(()),
        };
        if self.database.is_none() || self.interesting.is_empty() {
            return Ok(());
        }
        let cap: Vec<u8> = self
            .interesting
            .values()
            .map(|r| r.buffer.clone())
            .max_by(|a, b| sort_key(a).cmp(&sort_key(b)))
            .unwrap();
        let mut corpus = self
            .database
            .as_deref()
            .unwrap()
            .fetch(&key.secondary())
            .map_err(db_interrupt)?;
        corpus.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        for value in corpus {
            if sort_key(&value) <= sort_key(&cap) {
                self.cached_test_function(&value, test)?;
            }
            if let Some(db) = self.database.as_deref_mut() {
                db.delete(&key.secondary(), &value).map_err(db_interrupt)?;
            }
        }
        Ok(())
    }

    /// Run `buffer` through the test, reusing known outcomes where possible:
    /// first the outcome cache, then tree simulation for prefixes already
    /// known to overrun. Neither path invokes the test function.
    pub(crate) fn cached_test_function(
        &mut self,
        buffer: &[u8],
        test: &mut TestFn<'_>,
    ) -> Result<ConjectureResult, Interrupt> {
        let buffer = &buffer[..buffer.len().min(self.config.buffer_size)];
        if let Some(result) = self.cache.get(buffer) {
            return Ok(result);
        }
        if let Some(Status::Overrun) = self.tree.borrow().simulate(buffer) {
            let result = ConjectureResult::overrun(buffer.to_vec());
            self.cache.insert(buffer.to_vec(), result.clone());
            return Ok(result);
        }
        let observer = TreeRecordingObserver::new(Rc::clone(&self.tree));
        let data = ConjectureData::for_buffer(buffer).with_observer(Box::new(observer));
        let result = self.test_function(data, test)?;
        self.cache.insert(buffer.to_vec(), result.clone());
        if result.buffer != buffer {
            self.cache.insert(result.buffer.clone(), result.clone());
        }
        Ok(result)
    }

    /// Execute the test once and fold the outcome into the run state.
    pub(crate) fn test_function(
        &mut self,
        mut data: ConjectureData,
        test: &mut TestFn<'_>,
    ) -> Result<ConjectureResult, Interrupt> {
        if let Some(max_time) = self.config.max_time {
            if self.started.elapsed() > max_time {
                return Err(Interrupt::Exit(ExitReason::Interrupted));
            }
        }
        self.stats.call_count += 1;
        let call_started = Instant::now();
        let _ = test(&mut data);
        let call_elapsed = call_started.elapsed();
        data.freeze();
        let result = data.as_result();

        if self.config.verbose {
            debug!("{}", debug_line(&result));
        }
        if self.tree.borrow().is_inconsistent() {
            return Err(Interrupt::Error(EngineError::Flaky(
                "test made a different draw sequence for the same buffer prefix".into(),
            )));
        }

        match result.status {
            Status::Valid => self.stats.valid_examples += 1,
            Status::Invalid => self.stats.invalid_examples += 1,
            Status::Overrun => self.stats.overruns += 1,
            Status::Interesting => {}
        }
        for event in &result.events {
            *self.stats.event_counts.entry(event.clone()).or_insert(0) += 1;
        }

        if !self.config.suppress_health_checks
            && self.interesting.is_empty()
            && self.stats.call_count <= self.config.min_test_calls
            && call_elapsed >= self.config.slow_call_threshold
        {
            return Err(health_check(
                HealthCheck::TooSlow,
                format!("a single test call took {:?}", call_elapsed),
            ));
        }

        if result.status == Status::Interesting {
            self.note_interesting(&result)?;
        }
        Ok(result)
    }

    /// Dedup failures by origin, keeping only strict shortlex improvements,
    /// and mirror each improvement into the database.
    fn note_interesting(&mut self, result: &ConjectureResult) -> Result<(), Interrupt> {
        let origin = result.origin.unwrap_or(0);
        let previous = self.interesting.get(&origin).map(|r| r.buffer.clone());
        let improved = match &previous {
            None => true,
            Some(prev) => sort_key(&result.buffer) < sort_key(prev),
        };
        if !improved {
            return Ok(());
        }
        if let (Some(db), Some(key)) = (self.database.as_deref_mut(), &self.config.database_key) {
            if let Some(prev) = &previous {
                db.move_value(key, &key.secondary(), prev).map_err(db_interrupt)?;
            }
            db.save(key, &result.buffer).map_err(db_interrupt)?;
        }
        self.interesting.insert(origin, result.clone());
        if previous.is_some() {
            self.stats.shrinks += 1;
            debug!(origin, bytes = result.buffer.len(), "accepted shrink");
        }
        Ok(())
    }

    pub(crate) fn shrink_budget_exhausted(&self) -> bool {
        self.stats.shrinks >= self.config.max_shrinks
    }
}

/// The one-line trace written for each execution in verbose mode.
pub fn debug_line(result: &ConjectureResult) -> String {
    format!(
        "{} bytes {:?} -> {}",
        result.buffer.len(),
        result.buffer,
        result.status
    )
}

fn health_check(check: HealthCheck, message: String) -> Interrupt {
    Interrupt::Error(EngineError::FailedHealthCheck { check, message })
}

fn db_interrupt(e: DatabaseError) -> Interrupt {
    Interrupt::Error(EngineError::Database(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn result_for(buffer: &[u8]) -> ConjectureResult {
        let mut data = ConjectureData::for_buffer(buffer);
        let _ = data.draw_bytes(buffer.len());
        data.freeze();
        data.as_result()
    }

    #[test]
    fn default_config_matches_production_settings() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_examples, 100);
        assert_eq!(config.max_shrinks, 500);
        assert_eq!(config.buffer_size, 8 * 1024);
        assert_eq!(config.cache_size, 50_000);
        assert!(config.report_multiple_bugs);
        assert_eq!(
            config.phases,
            vec![Phase::Reuse, Phase::Generate, Phase::Shrink]
        );
    }

    #[test]
    fn lru_cache_evicts_oldest_entry() {
        let mut cache = LruCache::new(2);
        cache.insert(vec![1], result_for(&[1]));
        cache.insert(vec![2], result_for(&[2]));
        assert!(cache.get(&[1]).is_some());
        cache.insert(vec![3], result_for(&[3]));
        // [2] was least recently used.
        assert!(cache.get(&[2]).is_none());
        assert!(cache.get(&[1]).is_some());
        assert!(cache.get(&[3]).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lru_cache_overwrites_in_place() {
        let mut cache = LruCache::new(2);
        cache.insert(vec![1], result_for(&[1]));
        cache.insert(vec![1], result_for(&[9]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&[1]).unwrap().buffer, vec![9]);
    }

    #[test]
    fn debug_line_format() {
        let result = result_for(&[0, 1]);
        assert_eq!(debug_line(&result), "2 bytes [0, 1] -> VALID");
    }

    fn run_cached(
        runner: &mut ConjectureRunner,
        buffer: &[u8],
        test: &mut TestFn<'_>,
    ) -> ConjectureResult {
        match runner.cached_test_function(buffer, test) {
            Ok(result) => result,
            Err(_) => panic!("test function was interrupted"),
        }
    }

    #[test]
    fn cache_returns_known_outcomes_without_reinvoking() {
        let calls = Cell::new(0usize);
        let mut test = |data: &mut ConjectureData| -> Result<(), StopTest> {
            calls.set(calls.get() + 1);
            data.draw_bits(8, None)?;
            Ok(())
        };
        let mut runner = ConjectureRunner::new(RunnerConfig::default());
        let first = run_cached(&mut runner, &[5], &mut test);
        let second = run_cached(&mut runner, &[5], &mut test);
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(runner.stats().call_count, 1);
    }

    #[test]
    fn short_prefix_of_a_known_draw_is_a_cached_overrun() {
        let calls = Cell::new(0usize);
        let mut test = |data: &mut ConjectureData| -> Result<(), StopTest> {
            calls.set(calls.get() + 1);
            data.draw_bits(64, None)?;
            Ok(())
        };
        let mut runner = ConjectureRunner::new(RunnerConfig::default());
        run_cached(&mut runner, &[1, 2, 3, 4, 5, 6, 7, 8], &mut test);
        // The tree knows the first draw needs eight bytes, so a shorter
        // buffer resolves without running the test.
        let result = run_cached(&mut runner, &[1, 2, 3], &mut test);
        assert_eq!(result.status, Status::Overrun);
        assert_eq!(calls.get(), 1);
        assert_eq!(runner.cache.len(), 2);
    }

    #[test]
    fn cache_eviction_forces_reexecution() {
        let calls = Cell::new(0usize);
        let mut test = |data: &mut ConjectureData| -> Result<(), StopTest> {
            calls.set(calls.get() + 1);
            data.draw_bits(8, None)?;
            Ok(())
        };
        let config = RunnerConfig {
            cache_size: 5,
            ..RunnerConfig::default()
        };
        let mut runner = ConjectureRunner::new(config);
        // Ten distinct buffers through a five-entry cache, three times over:
        // sequential access always evicts the entry needed next.
        for _ in 0..3 {
            for b in 0..10u8 {
                run_cached(&mut runner, &[b], &mut test);
            }
        }
        assert_eq!(calls.get(), 30);
    }
}
