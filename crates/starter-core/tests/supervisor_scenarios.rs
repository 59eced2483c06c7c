//! Supervisor lifecycle scenarios against in-memory fakes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use starter_core::cluster::ServiceMode;
use starter_core::config::{BootstrapConfig, Config};
use starter_core::context::ClusterContext;
use starter_core::process::{Process, Runner, ServerType};
use starter_core::supervisor::{ServerManager, MAX_RECENT_FAILURES};

use common::{new_events, snapshot, FakeContext, FakeProcess, FakeRunner};

fn test_config() -> Config {
    Config {
        log_rotate_files_to_keep: 2,
        ..Default::default()
    }
}

/// Bootstrap config that limits cluster mode to the agent.
fn agent_only_bootstrap() -> BootstrapConfig {
    BootstrapConfig {
        start_dbserver: Some(false),
        start_coordinator: Some(false),
        start_sync_master: Some(false),
        start_sync_worker: Some(false),
        recovery_agent_id: None,
    }
}

#[tokio::test]
async fn test_single_mode_start() {
    let dir = tempfile::tempdir().unwrap();
    let events = new_events();
    let context = Arc::new(FakeContext::new(ServiceMode::Single, dir.path().to_path_buf()));
    let runner = Arc::new(FakeRunner::new(Arc::clone(&events)));
    let manager = Arc::new(ServerManager::new());

    let run = tokio::spawn(Arc::clone(&manager).run(
        context.cancel.clone(),
        Arc::clone(&context) as Arc<dyn ClusterContext>,
        Arc::clone(&runner) as Arc<dyn Runner>,
        test_config(),
        BootstrapConfig::default(),
    ));

    // The single slot must fill within the start deadline.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.process(ServerType::Single).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "single never started");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(manager.server_processes().len(), 1);

    context.stop();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run did not shut down")
        .unwrap();

    let events = snapshot(&events);
    assert!(events.contains(&"start:single".to_string()));
    assert!(events.contains(&"terminate:single".to_string()));
    assert!(events.contains(&"cleanup:single".to_string()));
    assert_eq!(runner.cleanup_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_port_in_use_is_retried_without_a_handle() {
    let dir = tempfile::tempdir().unwrap();
    let events = new_events();
    let context = Arc::new(FakeContext::new(
        ServiceMode::Cluster,
        dir.path().to_path_buf(),
    ));
    // Keep the agent port bound for the duration of the test.
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = blocker.local_addr().unwrap().port();
    context.set_port(ServerType::Agent, port);

    let runner = Arc::new(FakeRunner::new(Arc::clone(&events)));
    let manager = Arc::new(ServerManager::new());

    let run = tokio::spawn(Arc::clone(&manager).run(
        context.cancel.clone(),
        Arc::clone(&context) as Arc<dyn ClusterContext>,
        Arc::clone(&runner) as Arc<dyn Runner>,
        test_config(),
        agent_only_bootstrap(),
    ));

    // One retry takes a 3s port poll plus a 1s backoff.
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(manager.port_in_use_retries() >= 1);
    assert!(manager.process(ServerType::Agent).is_none());
    assert!(snapshot(&events).is_empty(), "no server may have started");
    assert_eq!(context.stop_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    context.stop();
    tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .expect("run did not shut down")
        .unwrap();
    drop(blocker);
}

#[tokio::test]
async fn test_fast_failures_stop_the_peer_once() {
    let dir = tempfile::tempdir().unwrap();
    let events = new_events();
    let mut context = FakeContext::new(ServiceMode::Single, dir.path().to_path_buf());
    context.probe_up = false;
    let context = Arc::new(context);
    let runner = Arc::new(FakeRunner::exiting_immediately(Arc::clone(&events)));
    let manager = Arc::new(ServerManager::new());

    let run = tokio::spawn(Arc::clone(&manager).run(
        context.cancel.clone(),
        Arc::clone(&context) as Arc<dyn ClusterContext>,
        Arc::clone(&runner) as Arc<dyn Runner>,
        test_config(),
        BootstrapConfig::default(),
    ));

    tokio::time::timeout(Duration::from_secs(60), run)
        .await
        .expect("supervisor did not give up")
        .unwrap();

    assert_eq!(context.stop_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(manager.is_stopping());
    let starts = snapshot(&events)
        .iter()
        .filter(|e| e.as_str() == "start:single")
        .count();
    assert_eq!(starts, MAX_RECENT_FAILURES);
}

#[tokio::test]
async fn test_shutdown_order_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let events = new_events();
    let context = Arc::new(FakeContext::new(
        ServiceMode::Cluster,
        dir.path().to_path_buf(),
    ));
    let runner = Arc::new(FakeRunner::new(Arc::clone(&events)));
    let manager = Arc::new(ServerManager::new());

    let run = tokio::spawn(Arc::clone(&manager).run(
        context.cancel.clone(),
        Arc::clone(&context) as Arc<dyn ClusterContext>,
        Arc::clone(&runner) as Arc<dyn Runner>,
        test_config(),
        BootstrapConfig::default(),
    ));

    // Wait until all five cluster roles hold a handle.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let roles = [
        ServerType::Agent,
        ServerType::DBServer,
        ServerType::Coordinator,
        ServerType::SyncMaster,
        ServerType::SyncWorker,
    ];
    while roles.iter().any(|t| manager.process(*t).is_none()) {
        assert!(tokio::time::Instant::now() < deadline, "servers never started");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    context.stop();
    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("run did not shut down")
        .unwrap();

    let events = snapshot(&events);
    let order_of = |event: &str| {
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event}"))
    };

    // Graceful termination runs in fixed order, agent last.
    assert!(order_of("terminate:syncworker") < order_of("terminate:syncmaster"));
    assert!(order_of("terminate:syncmaster") < order_of("terminate:coordinator"));
    assert!(order_of("terminate:coordinator") < order_of("terminate:dbserver"));
    assert!(order_of("terminate:dbserver") < order_of("terminate:agent"));
    // Cleanup happens after all terminations, runner cleanup last.
    assert!(order_of("terminate:agent") < order_of("cleanup:syncworker"));
    assert!(order_of("cleanup:agent") < order_of("runner-cleanup"));
    assert_eq!(runner.cleanup_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_restart_server_triggers_a_new_start() {
    let dir = tempfile::tempdir().unwrap();
    let events = new_events();
    let context = Arc::new(FakeContext::new(ServiceMode::Single, dir.path().to_path_buf()));
    let runner = Arc::new(FakeRunner::new(Arc::clone(&events)));
    let manager = Arc::new(ServerManager::new());

    let run = tokio::spawn(Arc::clone(&manager).run(
        context.cancel.clone(),
        Arc::clone(&context) as Arc<dyn ClusterContext>,
        Arc::clone(&runner) as Arc<dyn Runner>,
        test_config(),
        BootstrapConfig::default(),
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.process(ServerType::Single).is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let first_pid = manager.process(ServerType::Single).unwrap().process_id();

    manager.restart_server(ServerType::Single).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "single was not restarted"
        );
        if let Some(p) = manager.process(ServerType::Single) {
            if p.process_id() != first_pid {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    context.stop();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run did not shut down")
        .unwrap();
}

#[tokio::test]
async fn test_log_rotation_shape() {
    let dir = tempfile::tempdir().unwrap();
    let context = Arc::new(FakeContext::new(ServiceMode::Single, dir.path().to_path_buf()));
    let context_dyn = Arc::clone(&context) as Arc<dyn ClusterContext>;

    let log_dir = context.server_host_dir(ServerType::Single).unwrap();
    tokio::fs::create_dir_all(&log_dir).await.unwrap();
    let log_path = context.server_host_log_file(ServerType::Single).unwrap();
    tokio::fs::write(&log_path, "current").await.unwrap();
    tokio::fs::write(format!("{}.1", log_path.display()), "one")
        .await
        .unwrap();
    tokio::fs::write(format!("{}.2", log_path.display()), "two")
        .await
        .unwrap();

    let events = new_events();
    let process = Arc::new(FakeProcess::new(7, "single", Arc::clone(&events), false));
    let manager = ServerManager::new();
    let process_dyn: Arc<dyn Process> = Arc::clone(&process) as Arc<dyn Process>;
    manager
        .rotate_log_file(&context_dyn, ServerType::Single, &process_dyn, 2)
        .await;

    // log -> log.1, log.1 -> log.2, old log.2 removed.
    assert!(!log_path.exists());
    assert_eq!(
        tokio::fs::read_to_string(format!("{}.1", log_path.display()))
            .await
            .unwrap(),
        "current"
    );
    assert_eq!(
        tokio::fs::read_to_string(format!("{}.2", log_path.display()))
            .await
            .unwrap(),
        "one"
    );
    // The child was told to reopen its log file.
    assert_eq!(process.hups.load(std::sync::atomic::Ordering::SeqCst), 1);
}
