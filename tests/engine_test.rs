//! End-to-end runner behavior: generation, health checks, flakiness,
//! shrinking, and database round trips.

use std::cell::Cell;
use std::time::Duration;

use exemplar::{
    ConjectureData, ConjectureRunner, DatabaseKey, EngineError, ExampleDatabase, ExitReason,
    HealthCheck, InMemoryDatabase, Phase, RunnerConfig, Status, StopTest,
};

fn quiet_config() -> RunnerConfig {
    RunnerConfig {
        seed: 13,
        ..RunnerConfig::default()
    }
}

fn fetch_sorted(runner: &ConjectureRunner, key: &DatabaseKey) -> Vec<Vec<u8>> {
    let mut values = runner.database().unwrap().fetch(key).unwrap();
    values.sort_by(|a, b| (a.len(), a.clone()).cmp(&(b.len(), b.clone())));
    values
}

#[test]
fn finds_and_shrinks_a_simple_failure() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    let best = &runner.interesting_examples()[&0];
    assert_eq!(best.buffer, vec![1]);
    assert_eq!(runner.exit_reason(), Some(ExitReason::Finished));
}

#[test]
fn drawing_past_a_mark_does_not_derail_the_run() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                // Deliberately drop the stop signal and keep drawing.
                let _ = data.mark_interesting(0);
                let _ = data.draw_bits(8, None);
                data.start_span(1);
            }
            Ok(())
        })
        .unwrap();
    let best = &runner.interesting_examples()[&0];
    assert_eq!(best.buffer, vec![1]);
    assert_eq!(runner.exit_reason(), Some(ExitReason::Finished));
}

#[test]
fn persists_exactly_one_minimal_failure() {
    let key = DatabaseKey::from_test_name("persists_exactly_one_minimal_failure");
    let config = RunnerConfig {
        database_key: Some(key.clone()),
        ..quiet_config()
    };
    let mut runner =
        ConjectureRunner::new(config).with_database(Box::new(InMemoryDatabase::new()));
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(fetch_sorted(&runner, &key), vec![vec![1]]);
    assert!(fetch_sorted(&runner, &key.secondary()).is_empty());
}

#[test]
fn reuses_database_examples_and_drops_stale_ones() {
    let key = DatabaseKey::from_test_name("reuses_database_examples");
    let mut db = InMemoryDatabase::new();
    db.save(&key, &[7]).unwrap();
    db.save(&key, &[3]).unwrap();
    let config = RunnerConfig {
        database_key: Some(key.clone()),
        phases: vec![Phase::Reuse, Phase::Shrink],
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config).with_database(Box::new(db));
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b == 7 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.interesting_examples()[&0].buffer, vec![7]);
    // [3] no longer reproduces anything and is dropped.
    assert_eq!(fetch_sorted(&runner, &key), vec![vec![7]]);
}

#[test]
fn detects_flaky_failures_after_min_test_calls() {
    let failed_once = Cell::new(false);
    let mut runner = ConjectureRunner::new(quiet_config());
    let err = runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(8, None)?;
            if !failed_once.get() {
                failed_once.set(true);
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::Flaky(_)));
    assert_eq!(runner.exit_reason(), Some(ExitReason::Flaky));
    let min_test_calls = RunnerConfig::default().min_test_calls;
    assert_eq!(runner.stats().call_count, min_test_calls + 1);
}

#[test]
fn erratic_draw_structure_is_flaky() {
    let calls = Cell::new(0usize);
    let mut runner = ConjectureRunner::new(quiet_config());
    let err = runner
        .run(|data: &mut ConjectureData| {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                data.draw_bits(8, None)?;
            } else {
                data.draw_bits(16, None)?;
            }
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::Flaky(_)));
    assert_eq!(runner.exit_reason(), Some(ExitReason::Flaky));
}

#[test]
fn exhausts_a_one_bit_space() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(1, None)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.exit_reason(), Some(ExitReason::Finished));
    assert_eq!(runner.stats().valid_examples, 2);
    assert_eq!(runner.stats().call_count, 2);
}

#[test]
fn discards_prune_the_search_tree() {
    let config = RunnerConfig {
        max_examples: 5000,
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    runner
        .run(|data: &mut ConjectureData| {
            data.start_span(1);
            let b = data.draw_bits(8, None)?;
            data.stop_span(b != 0);
            Ok(())
        })
        .unwrap();
    // Every byte value is tried exactly once; killed branches are never
    // generated again.
    assert_eq!(runner.stats().call_count, 256);
    assert_eq!(runner.exit_reason(), Some(ExitReason::Finished));
}

#[test]
fn stops_generating_once_a_bug_is_known_when_not_reporting_multiple() {
    let config = RunnerConfig {
        report_multiple_bugs: false,
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            data.mark_interesting(b & 1)?;
            Ok(())
        })
        .unwrap();
    // One generation call plus the pre-shrink reproduction check.
    assert_eq!(runner.stats().call_count, 2);
    assert_eq!(runner.interesting_examples().len(), 1);
}

#[test]
fn shrinks_each_origin_to_its_own_minimum() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b == 0 {
                data.mark_interesting(0)?;
            } else {
                data.mark_interesting(1)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.interesting_examples()[&0].buffer, vec![0]);
    assert_eq!(runner.interesting_examples()[&1].buffer, vec![1]);
}

#[test]
fn bounds_invalid_runs_by_the_call_ceiling() {
    let config = RunnerConfig {
        max_examples: 10,
        suppress_health_checks: true,
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(64, None)?;
            data.mark_invalid()?;
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.exit_reason(), Some(ExitReason::MaxIterations));
    assert_eq!(runner.stats().call_count, 1000);
    assert_eq!(runner.stats().valid_examples, 0);
}

#[test]
fn stops_at_max_examples_when_everything_passes() {
    let config = RunnerConfig {
        max_examples: 20,
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(64, None)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.exit_reason(), Some(ExitReason::MaxExamples));
    assert_eq!(runner.stats().valid_examples, 20);
}

#[test]
fn health_check_fires_when_filtering_too_much() {
    let mut runner = ConjectureRunner::new(quiet_config());
    let err = runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(64, None)?;
            data.mark_invalid()?;
            Ok(())
        })
        .unwrap_err();
    match err {
        EngineError::FailedHealthCheck { check, .. } => {
            assert_eq!(check, HealthCheck::FilterTooMuch)
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn health_check_fires_when_data_is_too_large() {
    let config = quiet_config();
    let buffer_size = config.buffer_size;
    let mut runner = ConjectureRunner::new(config);
    let err = runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b != 0 {
                data.draw_bytes(buffer_size)?;
            }
            Ok(())
        })
        .unwrap_err();
    match err {
        EngineError::FailedHealthCheck { check, .. } => {
            assert_eq!(check, HealthCheck::DataTooLarge)
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn health_check_fires_on_a_large_base_example() {
    let mut runner = ConjectureRunner::new(quiet_config());
    let err = runner
        .run(|data: &mut ConjectureData| {
            data.draw_bytes(5000)?;
            Ok(())
        })
        .unwrap_err();
    match err {
        EngineError::FailedHealthCheck { check, .. } => {
            assert_eq!(check, HealthCheck::LargeBaseExample)
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn health_check_fires_on_slow_test_calls() {
    let config = RunnerConfig {
        slow_call_threshold: Duration::from_millis(50),
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    let err = runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(8, None)?;
            std::thread::sleep(Duration::from_millis(80));
            Ok(())
        })
        .unwrap_err();
    match err {
        EngineError::FailedHealthCheck { check, .. } => assert_eq!(check, HealthCheck::TooSlow),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn removes_discarded_spans_while_shrinking() {
    let key = DatabaseKey::from_test_name("removes_discarded_spans");
    let mut db = InMemoryDatabase::new();
    db.save(&key, &[0, 0, 0, 11]).unwrap();
    let config = RunnerConfig {
        database_key: Some(key.clone()),
        phases: vec![Phase::Reuse, Phase::Shrink],
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config).with_database(Box::new(db));
    runner
        .run(|data: &mut ConjectureData| {
            loop {
                data.start_span(1);
                let b = data.draw_bits(8, None)?;
                data.stop_span(b == 0);
                if b != 0 {
                    if b >= 10 {
                        data.mark_interesting(0)?;
                    }
                    break;
                }
            }
            Ok(())
        })
        .unwrap();
    // The zero padding is discarded in one step and the survivor minimized.
    assert_eq!(runner.interesting_examples()[&0].buffer, vec![10]);
    assert_eq!(fetch_sorted(&runner, &key), vec![vec![10]]);
    assert!(fetch_sorted(&runner, &key.secondary()).is_empty());
}

#[test]
fn terminates_shrinking_at_the_budget() {
    let key = DatabaseKey::from_test_name("terminates_shrinking_at_the_budget");
    let mut db = InMemoryDatabase::new();
    db.save(&key, &[3, 3, 3]).unwrap();
    let config = RunnerConfig {
        database_key: Some(key.clone()),
        phases: vec![Phase::Reuse, Phase::Shrink],
        max_shrinks: 3,
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config).with_database(Box::new(db));
    runner
        .run(|data: &mut ConjectureData| {
            let a = data.draw_bits(8, None)?;
            let b = data.draw_bits(8, None)?;
            let c = data.draw_bits(8, None)?;
            if a >= 1 && b >= 1 && c >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.exit_reason(), Some(ExitReason::MaxShrinks));
    assert_eq!(runner.stats().shrinks, 3);
    // Each accepted shrink moved the previous best to the secondary key,
    // and an aborted shrink leaves them in place for the next run.
    assert_eq!(fetch_sorted(&runner, &key.secondary()).len(), 3);
    assert_eq!(fetch_sorted(&runner, &key), vec![vec![1, 1, 1]]);
}

#[test]
fn shrinks_length_prefixed_data() {
    let key = DatabaseKey::from_test_name("shrinks_length_prefixed_data");
    let mut db = InMemoryDatabase::new();
    db.save(&key, &[2, 7, 7]).unwrap();
    let config = RunnerConfig {
        database_key: Some(key.clone()),
        phases: vec![Phase::Reuse, Phase::Shrink],
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config).with_database(Box::new(db));
    runner
        .run(|data: &mut ConjectureData| {
            let n = data.draw_bits(8, None)?;
            let mut first = None;
            for _ in 0..n {
                let elem = data.draw_bits(8, None)?;
                if first.is_none() {
                    first = Some(elem);
                }
            }
            if first == Some(7) {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.interesting_examples()[&0].buffer, vec![1, 7]);
}

#[test]
fn lowers_duplicate_blocks_together() {
    let key = DatabaseKey::from_test_name("lowers_duplicate_blocks_together");
    let mut db = InMemoryDatabase::new();
    db.save(&key, &[2, 2, 0]).unwrap();
    let config = RunnerConfig {
        database_key: Some(key.clone()),
        phases: vec![Phase::Reuse, Phase::Shrink],
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config).with_database(Box::new(db));
    runner
        .run(|data: &mut ConjectureData| {
            let a = data.draw_bits(8, None)?;
            let b = data.draw_bits(8, None)?;
            data.draw_bits(8, None)?;
            if a == b && a >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.interesting_examples()[&0].buffer, vec![1, 1, 0]);
}

#[test]
fn forced_bytes_survive_shrinking() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            data.write(&[42])?;
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.interesting_examples()[&0].buffer, vec![42, 1]);
}

#[test]
fn counts_events_across_the_run() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(1, None)?;
            if b == 0 {
                data.note_event("even");
            } else {
                data.note_event("odd");
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.stats().event_counts.get("even"), Some(&1));
    assert_eq!(runner.stats().event_counts.get("odd"), Some(&1));
}

#[test]
fn phases_can_disable_shrinking() {
    let config = RunnerConfig {
        phases: vec![Phase::Generate],
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    // The failure is recorded but the shrink phase never runs.
    let best = &runner.interesting_examples()[&0];
    assert!(best.buffer[0] >= 1);
    assert_eq!(runner.exit_reason(), Some(ExitReason::Finished));
}

#[test]
fn empty_phase_list_runs_nothing() {
    let config = RunnerConfig {
        phases: Vec::new(),
        ..quiet_config()
    };
    let mut runner = ConjectureRunner::new(config);
    runner
        .run(|data: &mut ConjectureData| {
            data.draw_bits(8, None)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.stats().call_count, 0);
    assert_eq!(runner.exit_reason(), Some(ExitReason::Finished));
}

#[test]
fn runners_compose_by_nesting() {
    let config = RunnerConfig {
        max_examples: 10,
        ..quiet_config()
    };
    let mut outer = ConjectureRunner::new(config);
    outer
        .run(|data: &mut ConjectureData| {
            data.draw_bits(8, None)?;
            let mut inner = ConjectureRunner::new(RunnerConfig {
                max_examples: 5,
                ..RunnerConfig::default()
            });
            inner
                .run(|inner_data: &mut ConjectureData| {
                    inner_data.draw_bits(1, None)?;
                    Ok(())
                })
                .map_err(|_| StopTest)?;
            assert_eq!(inner.stats().valid_examples, 2);
            Ok(())
        })
        .unwrap();
    assert_eq!(outer.exit_reason(), Some(ExitReason::MaxExamples));
}

#[test]
fn database_untouched_without_a_key() {
    let mut db = InMemoryDatabase::new();
    let unrelated = DatabaseKey::from_test_name("unrelated");
    db.save(&unrelated, &[9]).unwrap();
    let mut runner =
        ConjectureRunner::new(quiet_config()).with_database(Box::new(db));
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                data.mark_interesting(0)?;
            }
            Ok(())
        })
        .unwrap();
    let db = runner.database().unwrap();
    assert_eq!(db.fetch(&unrelated).unwrap(), vec![vec![9]]);
}

#[test]
fn interesting_results_expose_status_and_origin() {
    let mut runner = ConjectureRunner::new(quiet_config());
    runner
        .run(|data: &mut ConjectureData| {
            let b = data.draw_bits(8, None)?;
            if b >= 1 {
                data.mark_interesting(3)?;
            }
            Ok(())
        })
        .unwrap();
    let best = &runner.interesting_examples()[&3];
    assert_eq!(best.status, Status::Interesting);
    assert_eq!(best.origin, Some(3));
}
