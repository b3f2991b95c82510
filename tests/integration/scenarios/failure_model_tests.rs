use crate::infrastructure::{tick_until, AgentHarness, RecordingTest};
use anyhow::Result;
use netunit::minimal_client::ConnectionState;
use netunit::requirements::{Requirement, RequirementSet};
use netunit::settings::{TestFlags, UnitTestSettings, VerificationState};
use netunit::suspend::{pipe_path, ResumeOutcome};
use std::time::Duration;
use tokio::time::Instant;

fn player_controller() -> RequirementSet {
    [Requirement::PlayerController].into_iter().collect()
}

/// Auto-reconnect resets requirements and connects again without a verdict
#[tokio::test]
async fn test_auto_reconnect_after_disconnect() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings {
        requirements: player_controller(),
        flags: TestFlags { auto_reconnect: true, ..Default::default() },
        ..harness.client_settings("Reconnects")
    };
    let (test, record) = RecordingTest::new(settings, |_| {});
    let mut orchestrator = harness.orchestrator(test);

    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.payload_executed()).await);

    harness.agent.disconnect_all();
    assert!(
        tick_until(&mut orchestrator, Duration::from_secs(10), |o| {
            o.connect_attempts() == 2 && o.requirements().met().contains(Requirement::PlayerController)
        })
        .await
    );

    assert_eq!(orchestrator.verification(), VerificationState::Unverified);
    assert_eq!(record.lock().unwrap().executions, 1);
    assert_eq!(orchestrator.client_state(), Some(ConnectionState::Open));
    orchestrator.cleanup(Instant::now());
    Ok(())
}

/// A disconnect with no declared policy fails the test
#[tokio::test]
async fn test_unexpected_disconnect_needs_update() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings { requirements: player_controller(), ..harness.client_settings("Dropped") };
    let (test, _) = RecordingTest::new(settings, |_| {});
    let mut orchestrator = harness.orchestrator(test);

    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.payload_executed()).await);

    harness.agent.disconnect_all();
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.is_done()).await);
    assert_eq!(orchestrator.verification(), VerificationState::VerifiedNeedsUpdate);
    assert_eq!(orchestrator.connect_attempts(), 1);
    Ok(())
}

/// An expected disconnect is logged and leaves the verdict open
#[tokio::test]
async fn test_expected_disconnect_keeps_running() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings {
        requirements: player_controller(),
        flags: TestFlags { expect_disconnect: true, ..Default::default() },
        ..harness.client_settings("KickedOnPurpose")
    };
    let (test, _) = RecordingTest::new(settings, |_| {});
    let mut orchestrator = harness.orchestrator(test);

    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.payload_executed()).await);

    harness.agent.disconnect_all();
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| !o.has_client()).await);

    assert!(!orchestrator.is_done());
    assert_eq!(orchestrator.verification(), VerificationState::Unverified);
    assert!(orchestrator
        .status_log()
        .entries()
        .iter()
        .any(|e| e.message.starts_with("Expected disconnect")));
    orchestrator.cleanup(Instant::now());
    Ok(())
}

/// A refused connection is a network failure
#[tokio::test]
async fn test_refused_connection_needs_update() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let unused = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let settings = UnitTestSettings { server_address: Some(unused.to_string()), ..harness.client_settings("Refused") };
    let (test, record) = RecordingTest::new(settings, |_| {});
    let mut orchestrator = harness.orchestrator(test);

    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.is_done()).await);
    assert_eq!(orchestrator.verification(), VerificationState::VerifiedNeedsUpdate);
    assert_eq!(record.lock().unwrap().executions, 0);
    Ok(())
}

/// The agent blocks on its resume pipe until the harness resumes it
#[tokio::test]
async fn test_suspend_and_resume_agent() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings { requirements: player_controller(), ..harness.client_settings("Suspends") };
    let (test, _) = RecordingTest::new(settings, |_| {});
    let mut orchestrator = harness.orchestrator(test);

    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.payload_executed()).await);
    orchestrator.request_suspend()?;

    let pid = std::process::id();
    let pipe = pipe_path(&harness.environment.suspend_pipe_prefix, pid);
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut outcome = ResumeOutcome::PipeNotReady;
    while outcome == ResumeOutcome::PipeNotReady && Instant::now() < deadline {
        orchestrator.tick(Instant::now());
        outcome = orchestrator.resume_process(pid)?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(outcome, ResumeOutcome::Resumed);

    let deadline = Instant::now() + Duration::from_secs(5);
    while pipe.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!pipe.exists(), "resume pipe should be removed once resumed");

    assert_eq!(orchestrator.verification(), VerificationState::Unverified);
    orchestrator.cleanup(Instant::now());
    Ok(())
}
