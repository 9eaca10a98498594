//! Stress scenarios over the core primitives.
//!
//! Workers run on evthread execution threads, so every scenario also exercises
//! spawn, directory registration, and self-mutex teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use evthread_core::{
    Entry, ProxyMutex, RwLock, RwLockPolicy, Thread, ThreadHandle, ThreadState, directory, thread,
};
use serde::Serialize;
use serde_json::json;

use crate::report::{HarnessError, Outcome, ScenarioReport};

/// Selectable scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Scenario {
    /// Continuous reader churn with one pending writer.
    WriterProgress,
    /// Two `try_write_lock` contenders behind a reader, then against each other.
    TryWriteContention,
    /// Start many threads with entry functions and check their teardown.
    SpawnSmoke,
    /// Two threads alternating on one `ProxyMutex`.
    MutexPingpong,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::WriterProgress,
        Scenario::TryWriteContention,
        Scenario::SpawnSmoke,
        Scenario::MutexPingpong,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Scenario::WriterProgress => "writer_progress",
            Scenario::TryWriteContention => "try_write_contention",
            Scenario::SpawnSmoke => "spawn_smoke",
            Scenario::MutexPingpong => "mutex_pingpong",
        }
    }

    pub fn run(self, config: &ScenarioConfig) -> Result<ScenarioReport, HarnessError> {
        let started = Instant::now();
        let (passed, iterations, details) = match self {
            Scenario::WriterProgress => writer_progress(config)?,
            Scenario::TryWriteContention => try_write_contention(config)?,
            Scenario::SpawnSmoke => spawn_smoke(config)?,
            Scenario::MutexPingpong => mutex_pingpong(config)?,
        };
        Ok(ScenarioReport {
            scenario: self.name().to_owned(),
            outcome: if passed { Outcome::Pass } else { Outcome::Fail },
            iterations,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            details,
        })
    }
}

/// Knobs shared by all scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Rounds (contention, pingpong) or threads to start (spawn smoke).
    pub iterations: u64,
    /// Reader threads for `writer_progress`.
    pub threads: usize,
    /// Upper bound on any wait; exceeding it fails the scenario.
    pub timeout: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            threads: 4,
            timeout: Duration::from_secs(10),
        }
    }
}

type Verdict = (bool, u64, serde_json::Value);

fn start_worker(name: &str, f: impl FnOnce() + Send + 'static) -> ThreadHandle {
    Thread::new().start(name, None, 0, Entry::function(f))
}

fn join_all(scenario: Scenario, handles: Vec<ThreadHandle>) -> Result<(), HarnessError> {
    let mut first_panic = None;
    for handle in handles {
        if let Err(payload) = handle.join() {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            first_panic.get_or_insert(message);
        }
    }
    match first_panic {
        Some(message) => Err(HarnessError::WorkerPanicked {
            scenario: scenario.name().to_owned(),
            message,
        }),
        None => Ok(()),
    }
}

fn writer_progress(config: &ScenarioConfig) -> Result<Verdict, HarnessError> {
    let lock = Arc::new(RwLock::new(RwLockPolicy::NoWriterStarvation));
    let deadline = Instant::now() + config.timeout;
    let writer_done = Arc::new(AtomicBool::new(false));
    let turnovers = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..config.threads.max(1))
        .map(|i| {
            let lock = Arc::clone(&lock);
            let writer_done = Arc::clone(&writer_done);
            let turnovers = Arc::clone(&turnovers);
            start_worker(&format!("reader-{i}"), move || {
                while !writer_done.load(Ordering::Acquire) && Instant::now() < deadline {
                    let _read = lock.read();
                    turnovers.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_micros(100));
                }
            })
        })
        .collect();

    let warmup = (config.threads as u64).saturating_mul(8);
    while turnovers.load(Ordering::Relaxed) < warmup && Instant::now() < deadline {
        std::thread::yield_now();
    }
    let waiting_from = turnovers.load(Ordering::Relaxed);
    let wait_started = Instant::now();
    lock.write_lock();
    let waited = wait_started.elapsed();
    let acquired_in_time = Instant::now() < deadline;
    let turnovers_while_waiting = turnovers.load(Ordering::Relaxed) - waiting_from;
    writer_done.store(true, Ordering::Release);
    lock.unlock();

    join_all(Scenario::WriterProgress, readers)?;
    Ok((
        acquired_in_time,
        turnovers_while_waiting,
        json!({
            "readers": config.threads.max(1),
            "native_lock": lock.is_native(),
            "writer_wait_us": u64::try_from(waited.as_micros()).unwrap_or(u64::MAX),
            "total_reader_turnovers": turnovers.load(Ordering::Relaxed),
        }),
    ))
}

fn try_write_contention(config: &ScenarioConfig) -> Result<Verdict, HarnessError> {
    let lock = Arc::new(RwLock::new(RwLockPolicy::Default));
    let rounds = config.iterations.max(1);
    let violations = Arc::new(AtomicU64::new(0));

    for round in 0..rounds {
        lock.read_lock();
        let blocked: Vec<_> = (0..2)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let violations = Arc::clone(&violations);
                start_worker(&format!("blocked-{round}-{i}"), move || {
                    if lock.try_write_lock() {
                        violations.fetch_add(1, Ordering::Relaxed);
                        lock.unlock();
                    }
                })
            })
            .collect();
        join_all(Scenario::TryWriteContention, blocked)?;
        lock.unlock();

        let start = Arc::new(Barrier::new(2));
        let attempted = Arc::new(Barrier::new(2));
        let winners = Arc::new(AtomicUsize::new(0));
        let contenders: Vec<_> = (0..2)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let start = Arc::clone(&start);
                let attempted = Arc::clone(&attempted);
                let winners = Arc::clone(&winners);
                start_worker(&format!("contend-{round}-{i}"), move || {
                    start.wait();
                    let won = lock.try_write_lock();
                    if won {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                    attempted.wait();
                    if won {
                        lock.unlock();
                    }
                })
            })
            .collect();
        join_all(Scenario::TryWriteContention, contenders)?;
        if winners.load(Ordering::Relaxed) != 1 {
            violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    let violations = violations.load(Ordering::Relaxed);
    Ok((violations == 0, rounds, json!({ "violations": violations })))
}

fn spawn_smoke(config: &ScenarioConfig) -> Result<Verdict, HarnessError> {
    let count = config.iterations.clamp(1, 256);
    let mut failures = Vec::new();

    let mut started = Vec::new();
    for i in 0..count {
        let requested = format!("smoke-worker-number-{i}");
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let thread = Thread::new();
        let info = thread.info();
        let handle = thread.start(
            &requested,
            None,
            0,
            Entry::function(move || {
                let me = thread::current().map(|t| (t.name().to_owned(), t.holds_self_mutex()));
                if let Ok(mut slot) = sink.lock() {
                    *slot = me;
                }
            }),
        );
        started.push((requested, info, seen, handle));
    }

    for (requested, info, seen, handle) in started {
        if handle.join().is_err() {
            failures.push(format!("{requested}: panicked"));
            continue;
        }
        let expected: String = requested
            .chars()
            .scan(0, |len, c| {
                *len += c.len_utf8();
                (*len < evthread_core::MAX_THREAD_NAME_LENGTH).then_some(c)
            })
            .collect();
        match seen.lock().ok().and_then(|mut slot| slot.take()) {
            Some((name, true)) if name == expected => {}
            other => failures.push(format!("{requested}: saw {other:?}")),
        }
        if info.mutex().holding_count() != 0 || info.state() != ThreadState::Terminated {
            failures.push(format!("{requested}: not torn down: {info:?}"));
        }
    }

    Ok((failures.is_empty(), count, json!({ "failures": failures })))
}

fn mutex_pingpong(config: &ScenarioConfig) -> Result<Verdict, HarnessError> {
    let mutex = ProxyMutex::new();
    let rounds = config.iterations.max(1);
    let deadline = Instant::now() + config.timeout;
    let turn = Arc::new(AtomicU64::new(0));
    let violations = Arc::new(AtomicU64::new(0));
    let timed_out = Arc::new(AtomicBool::new(false));

    let players: Vec<_> = (0..2u64)
        .map(|side| {
            let mutex = Arc::clone(&mutex);
            let turn = Arc::clone(&turn);
            let violations = Arc::clone(&violations);
            let timed_out = Arc::clone(&timed_out);
            start_worker(&format!("pingpong-{side}"), move || {
                let me = directory::current_key();
                loop {
                    let now = turn.load(Ordering::Acquire);
                    if now >= rounds * 2 || timed_out.load(Ordering::Relaxed) {
                        return;
                    }
                    if now % 2 != side {
                        if Instant::now() >= deadline {
                            timed_out.store(true, Ordering::Relaxed);
                            return;
                        }
                        std::thread::yield_now();
                        continue;
                    }
                    let _hold = mutex.lock();
                    if mutex.holder() != Some(me) || mutex.held_by_current() != Some(1) {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    turn.store(now + 1, Ordering::Release);
                }
            })
        })
        .collect();
    join_all(Scenario::MutexPingpong, players)?;

    let violations = violations.load(Ordering::Relaxed);
    let timed_out = timed_out.load(Ordering::Relaxed);
    let handoffs = turn.load(Ordering::Acquire);
    Ok((
        violations == 0 && !timed_out && mutex.holding_count() == 0,
        handoffs,
        json!({ "violations": violations, "timed_out": timed_out }),
    ))
}
