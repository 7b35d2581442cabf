//! End-to-end scheduler tests with in-process fake workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use phantom_scheduler::config::SchedulerConfig;
use phantom_scheduler::error::Result;
use phantom_scheduler::node::NodeStatus;
use phantom_scheduler::proto::client::{submit, SubmitMode};
use phantom_scheduler::proto::wire;
use phantom_scheduler::worker::launcher::WorkerLauncher;
use phantom_scheduler::{Scheduler, Termination};

/// Launches a task per slot that records every payload it receives and
/// answers with `reply`.
#[derive(Clone, Default)]
struct RecordingLauncher {
    seen: Arc<Mutex<HashMap<u16, Vec<String>>>>,
    reply: &'static str,
    delay: Duration,
}

impl RecordingLauncher {
    fn new(reply: &'static str) -> Self {
        Self {
            reply,
            ..Default::default()
        }
    }

    fn seen(&self) -> HashMap<u16, Vec<String>> {
        self.seen.lock().unwrap().clone()
    }

    fn jobs_run(&self) -> usize {
        self.seen()
            .values()
            .flatten()
            .filter(|p| p.as_str() != "EXIT")
            .count()
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, host: &str, port: u16) -> Result<()> {
        let mut stream = TcpStream::connect((host, port)).await?;
        let seen = Arc::clone(&self.seen);
        let reply = self.reply;
        let delay = self.delay;
        tokio::spawn(async move {
            while let Ok(chunk) = wire::read_chunk(&mut stream).await {
                let text = String::from_utf8_lossy(&chunk).into_owned();
                seen.lock().unwrap().entry(port).or_default().push(text);
                if wire::is_exit(&chunk) {
                    break;
                }
                tokio::time::sleep(delay).await;
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

fn test_config(slots: usize) -> SchedulerConfig {
    let mut cfg = SchedulerConfig::default();
    cfg.network.bind_host = "127.0.0.1".into();
    cfg.network.advertise_host = Some("127.0.0.1".into());
    cfg.network.base_port = 0;
    cfg.network.port_attempts = 50;
    cfg.pool.slots = slots;
    cfg.pool.poll_interval_ms = 10;
    cfg.callback.connect_timeout_sec = 2;
    cfg
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_two_slot_scenario() {
    let launcher = RecordingLauncher::new("0");
    let scheduler = Scheduler::with_launcher(test_config(2), Arc::new(launcher.clone()));
    let mut running = scheduler.start().await.unwrap();
    let server = format!("127.0.0.1:{}", running.inbound_port());

    let ports = running.node_ports();
    assert_eq!(ports.len(), 2);
    assert!(ports[0] > running.inbound_port());
    assert!(ports[1] > ports[0]);

    // Non-blocking: exactly one worker sees the raw payload.
    submit(&server, b"JOB1", SubmitMode::NonBlocking).await.unwrap();
    wait_until("JOB1 dispatch", || launcher.jobs_run() == 1).await;
    let holders: Vec<_> = launcher
        .seen()
        .into_iter()
        .filter(|(_, jobs)| jobs.iter().any(|j| j == "JOB1"))
        .collect();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].1, vec!["JOB1"]);

    // Blocking: the completion code comes back on the callback.
    let mode = SubmitMode::Blocking {
        port: 0,
        wait: Duration::from_secs(5),
    };
    let report = submit(&server, b"JOB2", mode).await.unwrap();
    assert!(report.blocking);
    assert_eq!(report.code.as_deref(), Some("0"));

    // EXIT drains and stops every slot.
    submit(&server, b"EXIT", SubmitMode::NonBlocking).await.unwrap();
    let reports = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .expect("scheduler should stop after EXIT");

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| !r.worker_lost));
    assert_eq!(running.flag().get(), Termination::Drain);
    for (_, jobs) in launcher.seen() {
        assert_eq!(jobs.last().map(String::as_str), Some("EXIT"));
    }
    assert_eq!(launcher.jobs_run(), 2);
}

#[tokio::test]
async fn test_exit_drains_queued_jobs_first() {
    let launcher = RecordingLauncher {
        delay: Duration::from_millis(30),
        ..RecordingLauncher::new("0")
    };
    let scheduler = Scheduler::with_launcher(test_config(1), Arc::new(launcher.clone()));
    let mut running = scheduler.start().await.unwrap();
    let server = format!("127.0.0.1:{}", running.inbound_port());

    for i in 0..5 {
        let payload = format!("job-{}", i);
        submit(&server, payload.as_bytes(), SubmitMode::NonBlocking)
            .await
            .unwrap();
    }
    // Make sure every submission reached the queue or a worker.
    wait_until("all jobs accepted", || launcher.jobs_run() + running.queued() >= 5).await;

    submit(&server, b"EXIT", SubmitMode::NonBlocking).await.unwrap();
    let reports = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .expect("scheduler should drain and stop");

    assert_eq!(reports.len(), 1);
    let seen = launcher.seen();
    let mut jobs = seen.values().next().unwrap().clone();
    // Submissions are handled on separate tasks, so only EXIT's place is fixed.
    assert_eq!(jobs.pop().as_deref(), Some("EXIT"));
    jobs.sort();
    assert_eq!(jobs, vec!["job-0", "job-1", "job-2", "job-3", "job-4"]);
    assert_eq!(running.queued(), 0);
}

#[tokio::test]
async fn test_blocking_and_non_blocking_callback_counts() {
    let launcher = RecordingLauncher::new("42");
    let scheduler = Scheduler::with_launcher(test_config(2), Arc::new(launcher.clone()));
    let mut running = scheduler.start().await.unwrap();
    let server = format!("127.0.0.1:{}", running.inbound_port());

    // Host our own callback listener so we can count connections.
    let callback = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let callback_port = callback.local_addr().unwrap().port();

    let mut stream = TcpStream::connect(&server).await.unwrap();
    stream.write_all(b"BLOCKING").await.unwrap();
    assert!(wire::is_ack(&wire::read_chunk(&mut stream).await.unwrap()));
    stream.write_all(callback_port.to_string().as_bytes()).await.unwrap();
    assert!(wire::is_ack(&wire::read_chunk(&mut stream).await.unwrap()));
    stream.write_all(b"JOB2").await.unwrap();
    drop(stream);

    let (mut conn, _) = tokio::time::timeout(Duration::from_secs(5), callback.accept())
        .await
        .expect("callback expected")
        .unwrap();
    let mut code = String::new();
    conn.read_to_string(&mut code).await.unwrap();
    assert_eq!(code, "42");

    // A non-blocking job must not produce a second callback connection.
    submit(&server, b"JOB1", SubmitMode::NonBlocking).await.unwrap();
    wait_until("JOB1 dispatch", || launcher.jobs_run() == 2).await;
    let extra = tokio::time::timeout(Duration::from_millis(300), callback.accept()).await;
    assert!(extra.is_err());

    running.shutdown(Termination::Drain).await;
}

#[tokio::test]
async fn test_malformed_submission_does_not_disturb_others() {
    let launcher = RecordingLauncher::new("0");
    let scheduler = Scheduler::with_launcher(test_config(1), Arc::new(launcher.clone()));
    let mut running = scheduler.start().await.unwrap();
    let server = format!("127.0.0.1:{}", running.inbound_port());

    let mut bad = TcpStream::connect(&server).await.unwrap();
    bad.write_all(b"BLOCKING").await.unwrap();
    assert!(wire::is_ack(&wire::read_chunk(&mut bad).await.unwrap()));
    bad.write_all(b"not-a-port").await.unwrap();
    drop(bad);

    submit(&server, b"JOB1", SubmitMode::NonBlocking).await.unwrap();
    wait_until("JOB1 dispatch", || launcher.jobs_run() == 1).await;
    assert!(running.flag().is_running());

    running.shutdown(Termination::Drain).await;
}

#[tokio::test]
async fn test_base_port_in_use_falls_back() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let blocked = blocker.local_addr().unwrap().port();
    if blocked > u16::MAX - 100 {
        return;
    }

    let mut cfg = test_config(2);
    cfg.network.base_port = blocked;
    let launcher = RecordingLauncher::new("0");
    let scheduler = Scheduler::with_launcher(cfg, Arc::new(launcher));
    let mut running = scheduler.start().await.unwrap();

    assert!(running.inbound_port() > blocked);
    let ports = running.node_ports();
    assert!(ports[0] > running.inbound_port());
    assert!(ports[1] > ports[0]);

    running.shutdown(Termination::Immediate).await;
}

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let launcher = RecordingLauncher::new("0");
    let scheduler = Scheduler::with_launcher(test_config(2), Arc::new(launcher.clone()));
    let mut running = scheduler.start().await.unwrap();

    let first = running.shutdown(Termination::Immediate).await;
    assert_eq!(first.len(), 2);
    let second = running.shutdown(Termination::Immediate).await;
    assert!(second.is_empty());

    assert!(running
        .statuses()
        .iter()
        .all(|(_, status)| *status == NodeStatus::Dead));
    for (_, jobs) in launcher.seen() {
        assert_eq!(jobs, vec!["EXIT"]);
    }
}
