use crate::infrastructure::{tick_until, AgentHarness, RecordingTest};
use anyhow::Result;
use netunit::error::HarnessError;
use netunit::requirements::{Requirement, RequirementSet};
use netunit::settings::{UnitTestSettings, VerificationState};
use std::time::Duration;
use tokio::time::Instant;

fn requiring(requirements: &[Requirement]) -> RequirementSet {
    requirements.iter().copied().collect()
}

/// Ping with a player controller fires the payload exactly once after one pong
#[tokio::test]
async fn test_ping_after_player_controller_fires_once() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings {
        requirements: requiring(&[Requirement::PlayerController, Requirement::Ping]),
        ..harness.client_settings("PingPlayerController")
    };
    let (test, record) = RecordingTest::new(settings, |ctx| {
        ctx.verify(VerificationState::VerifiedFixed, "pong received");
    });

    let mut orchestrator = harness.orchestrator(test);
    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.is_done()).await);

    assert_eq!(orchestrator.verification(), VerificationState::VerifiedFixed);
    assert_eq!(record.lock().unwrap().executions, 1);
    assert_eq!(harness.agent.pings_answered(), 1);

    let met = orchestrator.requirements().met();
    assert!(met.contains(Requirement::Connection));
    assert!(met.contains(Requirement::PlayerController));
    assert!(met.contains(Requirement::Ping));
    assert_eq!(orchestrator.connect_attempts(), 1);
    Ok(())
}

/// Ping alongside Pawn fails validation and never connects
#[tokio::test]
async fn test_invalid_ping_combination_rejected() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings {
        requirements: requiring(&[Requirement::Ping, Requirement::Pawn]),
        ..harness.client_settings("PingWithPawn")
    };
    let (test, record) = RecordingTest::new(settings, |_| {});

    let mut orchestrator = harness.orchestrator(test);
    let result = orchestrator.execute(Instant::now());
    assert!(matches!(result, Err(HarnessError::ValidationFailed(_))));

    for _ in 0..5 {
        orchestrator.tick(Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(orchestrator.connect_attempts(), 0);
    assert_eq!(harness.agent.connection_count(), 0);
    assert_eq!(record.lock().unwrap().executions, 0);
    Ok(())
}

/// Replicated actors mark their requirement bits
#[tokio::test]
async fn test_actor_requirements_met_by_offers() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings {
        requirements: requiring(&[Requirement::PlayerController, Requirement::Pawn, Requirement::NutActor]),
        ..harness.client_settings("AllActors")
    };
    let (test, record) = RecordingTest::new(settings, |ctx| {
        ctx.verify(VerificationState::VerifiedFixed, "actors replicated");
    });

    let mut orchestrator = harness.orchestrator(test);
    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.is_done()).await);

    assert_eq!(orchestrator.verification(), VerificationState::VerifiedFixed);
    assert_eq!(record.lock().unwrap().executions, 1);
    assert!(orchestrator.requirements().unmet().is_empty());

    let accepted = wait_for_accepted(&harness, 3).await;
    assert!(accepted.contains(&"PlayerController".to_string()));
    assert!(accepted.contains(&"Pawn".to_string()));
    assert!(accepted.contains(&"NUTActor".to_string()));
    Ok(())
}

/// Unrequired actors are blocked by the client's filter
#[tokio::test]
async fn test_unrequired_actors_not_accepted() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let harness = AgentHarness::start().await?;
    let settings = UnitTestSettings {
        requirements: requiring(&[Requirement::Pawn]),
        ..harness.client_settings("PawnOnly")
    };
    let (test, _) = RecordingTest::new(settings, |ctx| {
        ctx.verify(VerificationState::VerifiedFixed, "pawn replicated");
    });

    let mut orchestrator = harness.orchestrator(test);
    orchestrator.execute(Instant::now())?;
    assert!(tick_until(&mut orchestrator, Duration::from_secs(10), |o| o.is_done()).await);

    assert_eq!(wait_for_accepted(&harness, 1).await, vec!["Pawn".to_string()]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.agent.accepted_actors(), vec!["Pawn".to_string()]);
    Ok(())
}

/// Actor replies reach the agent asynchronously.
async fn wait_for_accepted(harness: &AgentHarness, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.agent.accepted_actors().len() < count && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.agent.accepted_actors()
}
