use std::process::Command;
use std::time::Duration;

use evthread_harness::{Outcome, Scenario, ScenarioConfig, ScenarioReport};

fn small_config() -> ScenarioConfig {
    ScenarioConfig {
        iterations: 16,
        threads: 3,
        timeout: Duration::from_secs(10),
    }
}

#[test]
fn every_scenario_passes_on_a_small_run() {
    for scenario in Scenario::ALL {
        let report = scenario.run(&small_config()).unwrap();
        assert_eq!(report.scenario, scenario.name());
        assert_eq!(report.outcome, Outcome::Pass, "{report:?}");
    }
}

#[test]
fn spawn_smoke_reports_every_thread() {
    let report = Scenario::SpawnSmoke.run(&small_config()).unwrap();
    assert_eq!(report.iterations, 16);
    assert_eq!(report.details["failures"], serde_json::json!([]));
}

#[test]
fn writer_progress_records_reader_count() {
    let report = Scenario::WriterProgress.run(&small_config()).unwrap();
    assert!(report.passed());
    assert_eq!(report.details["readers"], 3);
}

#[test]
fn cli_run_prints_one_jsonl_report() {
    let output = Command::new(env!("CARGO_BIN_EXE_evthread-harness"))
        .args(["run", "try_write_contention", "--iterations", "4"])
        .output()
        .expect("failed to run evthread-harness");
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 1);
    let report: ScenarioReport = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(report.scenario, "try_write_contention");
    assert_eq!(report.iterations, 4);
}

#[test]
fn cli_all_writes_reports_to_file() {
    let dir = std::env::temp_dir().join(format!("evthread-harness-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("reports.jsonl");
    let status = Command::new(env!("CARGO_BIN_EXE_evthread-harness"))
        .args(["all", "--iterations", "8", "--threads", "2", "--output"])
        .arg(&path)
        .status()
        .expect("failed to run evthread-harness");
    assert!(status.success());

    let content = std::fs::read_to_string(&path).unwrap();
    let scenarios: Vec<String> = content
        .lines()
        .map(|line| serde_json::from_str::<ScenarioReport>(line).unwrap().scenario)
        .collect();
    assert_eq!(
        scenarios,
        ["writer_progress", "try_write_contention", "spawn_smoke", "mutex_pingpong"]
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cli_rejects_unknown_scenario() {
    let output = Command::new(env!("CARGO_BIN_EXE_evthread-harness"))
        .args(["run", "no_such_scenario"])
        .output()
        .expect("failed to run evthread-harness");
    assert!(!output.status.success());
}
