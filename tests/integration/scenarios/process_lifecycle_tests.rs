use crate::infrastructure::{tick_until, AgentHarness, RecordingTest};
use anyhow::Result;
use netunit::agent::{AgentConfig, AgentRegistries, AgentServer};
use netunit::requirements::{Requirement, RequirementSet};
use netunit::settings::{TestFlags, UnitTestSettings, VerificationState};
use std::time::Duration;
use tokio::time::Instant;

fn server_test(name: &str, script: &str, flags: TestFlags) -> UnitTestSettings {
    UnitTestSettings {
        name: name.to_string(),
        server_url: script.to_string(),
        flags: TestFlags { launch_server: true, ..flags },
        expected_result: VerificationState::VerifiedFixed,
        timeout_secs: 20,
        ..Default::default()
    }
}

/// Ready line, connection to the launched server, then an unexpected exit
#[tokio::test]
async fn test_server_exit_after_connect_needs_update() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = AgentHarness::start().await?;
    harness.environment.server_ready = vec!["Server ready".to_string()];

    let script = "sleep 1; echo 'Server ready'; sleep 2; exit 3";
    let (test, record) = RecordingTest::new(server_test("ServerCrashAfterJoin", script, TestFlags::default()), |_| {});
    let mut orchestrator = harness.orchestrator(test);
    orchestrator.execute(Instant::now())?;

    // Stand-in server on the allocated port
    let port = orchestrator.server_port().expect("server port allocated");
    let _server = AgentServer::bind(("127.0.0.1", port), AgentConfig::default(), AgentRegistries::with_defaults()).await?;

    assert!(tick_until(&mut orchestrator, Duration::from_secs(15), |o| o.is_done()).await);

    assert_eq!(orchestrator.verification(), VerificationState::VerifiedNeedsUpdate);
    assert_eq!(orchestrator.connect_attempts(), 1);
    assert_eq!(record.lock().unwrap().executions, 1);
    assert!(!orchestrator.has_client());
    assert!(orchestrator
        .status_log()
        .entries()
        .iter()
        .any(|e| e.message.contains("exited unexpectedly (exit code Some(3))")));
    Ok(())
}

/// The server only launches once the service reports ready
#[tokio::test]
async fn test_service_prelaunch_gates_server() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = AgentHarness::start().await?;
    let service_script = harness.temp_path().join("service.sh");
    std::fs::write(&service_script, "sleep 0.5\necho service-up\nsleep 30\n")?;
    harness.environment.service_program = Some("sh".into());
    harness.environment.service_params = service_script.display().to_string();
    harness.environment.service_ready = vec!["service-up".to_string()];
    harness.environment.server_ready = vec!["never printed".to_string()];

    let flags = TestFlags { launch_service: true, ..Default::default() };
    let (test, _) = RecordingTest::new(server_test("ServiceFirst", "sleep 30", flags), |_| {});
    let mut orchestrator = harness.orchestrator(test);

    orchestrator.execute(Instant::now())?;
    assert_eq!(orchestrator.server_port(), None);

    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.server_port().is_some()).await);
    let messages: Vec<String> = orchestrator.status_log().entries().iter().map(|e| e.message.clone()).collect();
    let service = messages.iter().position(|m| m == "Service ready");
    let server = messages.iter().position(|m| m.starts_with("Launched server"));
    assert!(service.is_some() && server.is_some());
    assert!(service < server);

    orchestrator.cleanup(Instant::now());
    Ok(())
}

/// Launches wait while another test's blocking process is alive
#[tokio::test]
async fn test_blocking_process_defers_launch() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = AgentHarness::start().await?;
    let service_script = harness.temp_path().join("blocking.sh");
    std::fs::write(&service_script, "echo blocking\nsleep 30\n")?;
    harness.environment.service_program = Some("sh".into());
    harness.environment.service_params = service_script.display().to_string();
    harness.environment.service_blocking = true;
    harness.environment.service_ready = vec!["never printed".to_string()];
    harness.environment.server_ready = vec!["never printed".to_string()];

    let custom: RequirementSet = [Requirement::Custom].into_iter().collect();
    let blocker_settings = UnitTestSettings {
        name: "Blocker".to_string(),
        flags: TestFlags { launch_service: true, ..Default::default() },
        requirements: custom,
        timeout_secs: 20,
        ..Default::default()
    };
    let (blocker_test, _) = RecordingTest::new(blocker_settings, |_| {});
    let mut blocker = harness.orchestrator(blocker_test);
    blocker.execute(Instant::now())?;

    let (waiting_test, _) = RecordingTest::new(server_test("Waiting", "sleep 30", TestFlags::default()), |_| {});
    let mut waiting = harness.orchestrator(waiting_test);
    waiting.execute(Instant::now())?;
    assert_eq!(waiting.server_port(), None);
    assert!(waiting
        .status_log()
        .entries()
        .iter()
        .any(|e| e.message.contains("Deferring launch")));

    blocker.cleanup(Instant::now());
    assert!(tick_until(&mut waiting, Duration::from_secs(10), |o| o.server_port().is_some()).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    while blocker.has_running_processes() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!blocker.has_running_processes());

    waiting.cleanup(Instant::now());
    Ok(())
}
