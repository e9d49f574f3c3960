//! Integration tests for the job manager.
//!
//! Runs real processes through the full lifecycle with a recording limiter
//! in place of cgroup v2, and verifies that:
//! - Status moves forward only and ends in Stopped or Error
//! - Output is streamed from the start to every reader
//! - Stop escalates and is idempotent
//! - Start failures leave an Error record and no leaked artifacts


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use rpsmanager::config::AttachMode;
use rpsmanager::error::{ErrorCode, WorkerError};
use rpsmanager::jobs::{JobStatus, EXIT_CODE_UNSET};
use test_harness::{assert_eventually, collect_output, TestWorker};
use uuid::Uuid;

#[tokio::test]
async fn test_job_runs_to_completion() {
    let worker = TestWorker::new();

    let job = worker.run("echo hello").await;

    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(job.exit_code, 0);
    assert_eq!(job.term_signal, None);
    assert!(job.error.is_none());
    assert!(job.pid.is_none());
    assert!(job.start_time.is_some());
    assert!(job.stop_time.unwrap() >= job.start_time.unwrap());

    let output = worker.manager.stream_job_output(&job.id).await.unwrap();
    assert_eq!(collect_output(output).await, b"hello\n");
}

#[tokio::test]
async fn test_start_returns_running_job() {
    let worker = TestWorker::new();

    let id = worker.manager.start_job("sleep 30").await.unwrap();
    let job = worker.manager.get_job_status(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Running);
    assert!(job.pid.is_some());
    assert_eq!(job.exit_code, EXIT_CODE_UNSET);
    assert_eq!(worker.limiter.created(), vec![id]);

    worker.manager.stop_job(&id).await.unwrap();
    worker.wait_terminal(&id).await;
}

#[tokio::test]
async fn test_nonzero_exit_is_stopped() {
    let worker = TestWorker::new();

    let job = worker.run("exit 3").await;

    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(job.exit_code, 3);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_stderr_is_captured() {
    let worker = TestWorker::new();

    let job = worker.run("echo out; echo err >&2").await;

    let output = worker.manager.stream_job_output(&job.id).await.unwrap();
    assert_eq!(collect_output(output).await, b"out\nerr\n");
}

#[tokio::test]
async fn test_stop_running_job() {
    let worker = TestWorker::new();
    let id = worker.manager.start_job("sleep 30").await.unwrap();

    let status = worker.manager.stop_job(&id).await.unwrap();
    assert_eq!(status, JobStatus::Running);

    let job = worker.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.stop_requested);
    assert_eq!(job.term_signal, Some(Signal::SIGTERM as i32));
    assert_eq!(job.exit_code, EXIT_CODE_UNSET);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_stop_escalates_to_sigkill() {
    let worker = TestWorker::with_config(|c| c.with_stop_grace_period(Duration::from_millis(200)));
    let id = worker
        .manager
        .start_job("trap '' TERM; while true; do sleep 0.05; done")
        .await
        .unwrap();
    // Give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    worker.manager.stop_job(&id).await.unwrap();

    let job = worker.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(job.term_signal, Some(Signal::SIGKILL as i32));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let worker = TestWorker::new();
    let id = worker.manager.start_job("sleep 30").await.unwrap();

    worker.manager.stop_job(&id).await.unwrap();
    worker.manager.stop_job(&id).await.unwrap();

    let job = worker.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Stopped);

    // Stopping a finished job reports its terminal status and changes nothing
    assert_eq!(
        worker.manager.stop_job(&id).await.unwrap(),
        JobStatus::Stopped
    );
    let again = worker.manager.get_job_status(&id).await.unwrap();
    assert_eq!(again.stop_time, job.stop_time);
    assert_eq!(again.term_signal, job.term_signal);
}

#[tokio::test]
async fn test_unexpected_signal_is_error() {
    let worker = TestWorker::new();
    let id = worker.manager.start_job("sleep 30").await.unwrap();
    let pid = worker.manager.get_job_status(&id).await.unwrap().pid.unwrap();

    // The job leads its own process group
    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let job = worker.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(!job.stop_requested);
    assert_eq!(job.term_signal, Some(Signal::SIGKILL as i32));
    assert_eq!(job.error.unwrap().code, ErrorCode::AbnormalTermination);
}

#[tokio::test]
async fn test_invalid_command_creates_nothing() {
    let worker = TestWorker::new();

    for command in ["", "   ", "echo \0"] {
        let err = worker.manager.start_job(command).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidCommand(_)));
    }

    assert!(worker.manager.list_jobs().await.is_empty());
    assert!(worker.limiter.created().is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let worker = TestWorker::new();
    let id = Uuid::new_v4();

    assert!(matches!(
        worker.manager.get_job_status(&id).await,
        Err(WorkerError::JobNotFound(e)) if e == id
    ));
    assert!(matches!(
        worker.manager.stop_job(&id).await,
        Err(WorkerError::JobNotFound(_))
    ));
    assert!(matches!(
        worker.manager.stream_job_output(&id).await,
        Err(WorkerError::JobNotFound(_))
    ));
    assert!(matches!(
        worker.manager.wait_for_exit(&id).await,
        Err(WorkerError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_cgroup_setup_failure_leaves_error_record() {
    let worker = TestWorker::new();
    worker.limiter.fail_create(true);

    let err = worker.manager.start_job("echo hello").await.unwrap_err();
    assert!(matches!(err, WorkerError::CgroupSetupFailed { .. }));
    assert_eq!(err.code(), Some(ErrorCode::CgroupSetupFailed));

    let id = err.job_id().unwrap();
    let job = worker.manager.get_job_status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.pid.is_none());
    assert!(job.start_time.is_none());
    assert!(job.stop_time.is_some());
    assert_eq!(job.error.unwrap().code, ErrorCode::CgroupSetupFailed);
    assert!(!worker.output_file(&id).exists());

    // Never ran, so there is nothing to stream
    let output = worker.manager.stream_job_output(&id).await.unwrap();
    assert!(collect_output(output).await.is_empty());
    assert_eq!(
        worker.manager.stop_job(&id).await.unwrap(),
        JobStatus::Error
    );
}

#[tokio::test]
async fn test_attach_failure_kills_child() {
    let worker = TestWorker::with_config(|c| c.with_attach_mode(AttachMode::AfterSpawn));
    worker.limiter.fail_attach(true);

    let err = worker.manager.start_job("sleep 30").await.unwrap_err();
    assert!(matches!(err, WorkerError::CgroupAttachFailed { .. }));

    let id = err.job_id().unwrap();
    let job = worker.manager.get_job_status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error.unwrap().code, ErrorCode::CgroupAttachFailed);
    assert_eq!(worker.limiter.destroyed(), vec![id]);
    assert!(!worker.output_file(&id).exists());
}

#[tokio::test]
async fn test_attach_after_spawn_records_pid() {
    let worker = TestWorker::with_config(|c| c.with_attach_mode(AttachMode::AfterSpawn));

    let id = worker.manager.start_job("sleep 30").await.unwrap();
    let pid = worker.manager.get_job_status(&id).await.unwrap().pid.unwrap();
    assert_eq!(worker.limiter.attached(), vec![(id, pid)]);

    worker.manager.stop_job(&id).await.unwrap();
    worker.wait_terminal(&id).await;
}

#[tokio::test]
async fn test_cgroup_created_and_destroyed_once_per_job() {
    let worker = TestWorker::new();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(worker.run(&format!("echo job{}", i)).await.id);
    }

    assert_eventually(
        || async { worker.limiter.destroyed().len() == ids.len() },
        Duration::from_secs(5),
        "every group should be destroyed",
    )
    .await;

    let mut created = worker.limiter.created();
    let mut destroyed = worker.limiter.destroyed();
    created.sort();
    destroyed.sort();
    ids.sort();
    assert_eq!(created, ids);
    assert_eq!(destroyed, ids);
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let worker = TestWorker::new();
    let id = worker
        .manager
        .start_job("for i in 1 2 3; do sleep 0.05; done")
        .await
        .unwrap();

    let rank = |s: JobStatus| match s {
        JobStatus::Pending => 0,
        JobStatus::Running => 1,
        JobStatus::Stopped | JobStatus::Error => 2,
    };

    let mut last = 0;
    loop {
        let job = worker.manager.get_job_status(&id).await.unwrap();
        let current = rank(job.status);
        assert!(current >= last, "status went backwards to {}", job.status);
        last = current;
        if job.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let terminal = worker.manager.get_job_status(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = worker.manager.get_job_status(&id).await.unwrap();
    assert_eq!(later.status, terminal.status);
    assert_eq!(later.stop_time, terminal.stop_time);
}

#[tokio::test]
async fn test_concurrent_readers_see_full_output() {
    let worker = TestWorker::new();
    let id = worker
        .manager
        .start_job("for i in 1 2 3; do echo line$i; sleep 0.1; done")
        .await
        .unwrap();

    let first = worker.manager.stream_job_output(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = worker.manager.stream_job_output(&id).await.unwrap();

    let (a, b) = tokio::join!(collect_output(first), collect_output(second));
    assert_eq!(a, b"line1\nline2\nline3\n");
    assert_eq!(b, b"line1\nline2\nline3\n");
}

#[tokio::test]
async fn test_stream_follows_until_stop() {
    let worker = TestWorker::new();
    let id = worker
        .manager
        .start_job("echo started; sleep 30")
        .await
        .unwrap();
    let stream = worker.manager.stream_job_output(&id).await.unwrap();

    let reader = tokio::spawn(collect_output(stream));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!reader.is_finished());

    worker.manager.stop_job(&id).await.unwrap();
    assert_eq!(reader.await.unwrap(), b"started\n");
}

#[tokio::test]
async fn test_dropped_reader_does_not_affect_job() {
    let worker = TestWorker::new();
    let id = worker
        .manager
        .start_job("echo one; sleep 0.2; echo two")
        .await
        .unwrap();

    drop(worker.manager.stream_job_output(&id).await.unwrap());

    let job = worker.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Stopped);
    let output = worker.manager.stream_job_output(&id).await.unwrap();
    assert_eq!(collect_output(output).await, b"one\ntwo\n");
}

#[tokio::test]
async fn test_list_jobs_in_creation_order() {
    let worker = TestWorker::new();

    let first = worker.run("true").await.id;
    let second = worker.run("true").await.id;

    let ids: Vec<Uuid> = worker
        .manager
        .list_jobs()
        .await
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(ids, vec![first, second]);
}

#[tokio::test]
async fn test_shutdown_stops_running_jobs() {
    let worker = TestWorker::new();
    let a = worker.manager.start_job("sleep 30").await.unwrap();
    let b = worker.manager.start_job("sleep 30").await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), worker.manager.shutdown())
        .await
        .expect("shutdown should finish");

    for id in [a, b] {
        let job = worker.manager.get_job_status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(job.stop_requested);
    }
}

#[tokio::test]
async fn test_output_removed_after_retention() {
    let worker =
        TestWorker::with_config(|c| c.with_output_retention(Duration::from_millis(100)));

    let job = worker.run("echo gone").await;
    let path = worker.output_file(&job.id);

    assert_eventually(
        || async { !path.exists() },
        Duration::from_secs(5),
        "output file should be removed after retention",
    )
    .await;

    // Expired output streams as empty
    let output = worker.manager.stream_job_output(&job.id).await.unwrap();
    assert!(collect_output(output).await.is_empty());
}

#[tokio::test]
async fn test_oom_kill_of_child_is_memory_limit_error() {
    let worker = TestWorker::new();
    worker.limiter.report_oom(true);

    // The shell survives and exits normally with the child's status
    let job = worker.run("sleep 5 & kill -9 $!; wait $!").await;

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.exit_code, 137);
    assert_eq!(job.term_signal, None);
    assert_eq!(job.error.unwrap().code, ErrorCode::MemoryLimitExceeded);
}

#[tokio::test]
async fn test_oom_after_stop_request_is_stopped() {
    let worker = TestWorker::new();
    worker.limiter.report_oom(true);
    let id = worker.manager.start_job("sleep 30").await.unwrap();

    worker.manager.stop_job(&id).await.unwrap();

    let job = worker.wait_terminal(&id).await;
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_group_killed_before_job_is_terminal() {
    let worker = TestWorker::new();

    let job = worker.run("(sleep 0.3; echo late) &").await;
    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(worker.limiter.killed(), vec![job.id]);

    let streamed = collect_output(worker.manager.stream_job_output(&job.id).await.unwrap()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Nothing reaches the file after the stream has ended
    let on_disk = std::fs::read(worker.output_file(&job.id)).unwrap();
    assert_eq!(streamed, on_disk);
    assert!(on_disk.is_empty());
}

#[tokio::test]
async fn test_output_create_failure_leaves_error_record() {
    let worker = TestWorker::new();
    std::fs::remove_dir_all(worker.dir.path().join("output")).unwrap();

    let err = worker.manager.start_job("echo hello").await.unwrap_err();
    assert!(matches!(err, WorkerError::OutputCreateFailed { .. }));

    let id = err.job_id().unwrap();
    let job = worker.manager.get_job_status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.pid.is_none());
    assert_eq!(job.error.unwrap().code, ErrorCode::OutputCreateFailed);
    assert_eq!(worker.limiter.created(), vec![id]);
    assert_eq!(worker.limiter.destroyed(), vec![id]);

    let output = worker.manager.stream_job_output(&id).await.unwrap();
    assert!(collect_output(output).await.is_empty());
}

#[tokio::test]
async fn test_spawn_failure_leaves_error_record() {
    let worker = TestWorker::new();
    // The child cannot join its group, so exec never happens
    worker.limiter.read_only_attachment(true);

    let err = worker.manager.start_job("echo hello").await.unwrap_err();
    assert!(matches!(err, WorkerError::ProcessSpawnFailed { .. }));
    assert_eq!(err.code(), Some(ErrorCode::ProcessSpawnFailed));

    let id = err.job_id().unwrap();
    let job = worker.manager.get_job_status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.pid.is_none());
    assert!(job.start_time.is_none());
    assert_eq!(job.error.unwrap().code, ErrorCode::ProcessSpawnFailed);
    assert_eq!(worker.limiter.destroyed(), vec![id]);
    assert!(!worker.output_file(&id).exists());

    let output = worker.manager.stream_job_output(&id).await.unwrap();
    assert!(collect_output(output).await.is_empty());
}

#[tokio::test]
async fn test_slow_cgroup_work_does_not_stall_runtime() {
    let worker = TestWorker::with_config(|c| c.with_attach_mode(AttachMode::AfterSpawn));
    worker.limiter.slow_down(Duration::from_millis(300));
    worker.limiter.fail_attach(true);

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = ticks.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Group creation and teardown each block for 300ms
    let err = worker.manager.start_job("sleep 30").await.unwrap_err();
    let counted = ticks.load(Ordering::SeqCst);
    ticker.abort();

    assert!(matches!(err, WorkerError::CgroupAttachFailed { .. }));
    assert!(counted >= 30, "runtime stalled, only {} ticks", counted);
}
