//! Isolated runner against a real interpreter.
//!
//! Every test returns early when `python3` is not on PATH.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use smartscrape_core::sandbox::ABORTED_MESSAGE;
use smartscrape_core::{
    ExecutionOutcome, ExecutionStatus, IsolatedRunner, RevisionOrigin, RunRequest, RunnerConfig,
    ScriptExecutor, ScriptRevision, WhitelistPolicy,
};

fn python_available() -> bool {
    let found = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !found {
        eprintln!("python3 not found, skipping");
    }
    found
}

fn runner(max_workers: usize) -> IsolatedRunner {
    let config = RunnerConfig {
        max_workers,
        kill_grace_ms: 500,
        ..RunnerConfig::default()
    };
    IsolatedRunner::new(config, &WhitelistPolicy::default())
}

async fn run(runner: &IsolatedRunner, source: &str, timeout: Duration) -> ExecutionOutcome {
    let revision = ScriptRevision::root(source, RevisionOrigin::Submitted);
    let (_abort_tx, abort_rx) = watch::channel(false);
    runner
        .execute(&revision, &RunRequest::new("https://example.com/list", timeout), abort_rx)
        .await
}

#[tokio::test]
async fn records_are_extracted() {
    if !python_available() {
        return;
    }
    let source = "import json\n\ndef scrape(url):\n    print('fetching', url)\n    return [{'url': url, 'rank': i} for i in range(3)]\n";
    let outcome = run(&runner(2), source, Duration::from_secs(10)).await;

    assert_eq!(outcome.status, ExecutionStatus::Succeeded, "{outcome:?}");
    assert_eq!(outcome.record_count(), 3);
    assert_eq!(outcome.extracted_records[0]["url"], "https://example.com/list");
    assert!(outcome.stdout.contains("fetching"));
}

#[tokio::test]
async fn single_dict_becomes_one_record() {
    if !python_available() {
        return;
    }
    let outcome = run(
        &runner(1),
        "def scrape(url):\n    return {'title': 'x'}\n",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert_eq!(outcome.record_count(), 1);
}

#[tokio::test]
async fn runtime_exception_keeps_trace() {
    if !python_available() {
        return;
    }
    let source = "def scrape(url):\n    row = {}\n    return [row['price']]\n";
    let outcome = run(&runner(1), source, Duration::from_secs(10)).await;

    assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
    let trace = outcome.exception_trace.as_deref().unwrap_or_default();
    assert!(trace.contains("KeyError"), "{trace}");
    assert!(trace.contains("scraper.py"));
    assert!(outcome.error_message.unwrap().starts_with("KeyError"));
}

#[tokio::test]
async fn missing_entry_point_is_runtime_failure() {
    if !python_available() {
        return;
    }
    let outcome = run(&runner(1), "x = 1\n", Duration::from_secs(10)).await;
    assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
    assert!(outcome.error_message.unwrap().contains("scrape"));
}

#[tokio::test]
async fn empty_and_null_records_are_empty_result() {
    if !python_available() {
        return;
    }
    let runner = runner(2);
    for source in [
        "def scrape(url):\n    return []\n",
        "def scrape(url):\n    return None\n",
        "def scrape(url):\n    return [{'title': None}]\n",
    ] {
        let outcome = run(&runner, source, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, ExecutionStatus::EmptyResult, "{source}");
        assert!(outcome.error_message.is_some());
    }
}

#[tokio::test]
async fn infinite_loop_times_out_and_frees_its_slot() {
    if !python_available() {
        return;
    }
    let runner = runner(1);
    let budget = Duration::from_millis(700);

    let started = Instant::now();
    let outcome = run(&runner, "def scrape(url):\n    while True:\n        pass\n", budget).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, ExecutionStatus::Timeout);
    assert!(outcome.error_message.unwrap().contains("700 ms"));
    assert!(elapsed < budget + Duration::from_millis(500) + Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(runner.pool().available(), 1);

    let next = run(&runner, "def scrape(url):\n    return [1]\n", Duration::from_secs(10)).await;
    assert_eq!(next.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn abort_kills_running_script() {
    if !python_available() {
        return;
    }
    let runner = runner(1);
    let revision = ScriptRevision::root(
        "import time\n\ndef scrape(url):\n    time.sleep(30)\n    return [1]\n",
        RevisionOrigin::Submitted,
    );
    let (abort_tx, abort_rx) = watch::channel(false);
    let request = RunRequest::new("https://example.com", Duration::from_secs(30));

    let started = Instant::now();
    let run = runner.execute(&revision, &request, abort_rx);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::time::sleep(Duration::from_millis(300)) => {
            abort_tx.send_replace(true);
            run.await
        }
    };

    assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
    assert_eq!(outcome.error_message.as_deref(), Some(ABORTED_MESSAGE));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn restricted_builtins_back_up_the_checker() {
    if !python_available() {
        return;
    }
    let runner = runner(2);

    let outcome = run(
        &runner,
        "def scrape(url):\n    return [open('/etc/hostname').read()]\n",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
    assert!(outcome.error_message.unwrap().starts_with("NameError"));

    let outcome = run(
        &runner,
        "def scrape(url):\n    import socket\n    return [1]\n",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(outcome.status, ExecutionStatus::RuntimeFailure);
    assert!(outcome.error_message.unwrap().contains("socket"));
}

#[tokio::test]
async fn large_output_is_truncated() {
    if !python_available() {
        return;
    }
    let config = RunnerConfig {
        output_limit_bytes: 1024,
        ..RunnerConfig::default()
    };
    let runner = IsolatedRunner::new(config, &WhitelistPolicy::default());
    let outcome = run(
        &runner,
        "def scrape(url):\n    print('x' * 100000)\n    return [1]\n",
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(outcome.status, ExecutionStatus::Succeeded);
    assert!(outcome.stdout.len() < 4096);
}

#[cfg(unix)]
#[tokio::test]
async fn timeout_kills_spawned_grandchildren() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("survivor");

    let mut policy = WhitelistPolicy::default();
    policy.allowed_modules.insert("subprocess".into());
    policy.allowed_modules.insert("sys".into());
    let config = RunnerConfig {
        kill_grace_ms: 500,
        ..RunnerConfig::default()
    };
    let runner = IsolatedRunner::new(config, &policy);

    let source = format!(
        "import subprocess\nimport sys\n\ndef scrape(url):\n    subprocess.Popen([sys.executable, '-c', \"import time; time.sleep(1.5); open(r'{}', 'w').write('x')\"])\n    while True:\n        pass\n",
        marker.display()
    );
    let outcome = run(&runner, &source, Duration::from_millis(500)).await;
    assert_eq!(outcome.status, ExecutionStatus::Timeout);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists(), "grandchild outlived the run");
}
