use crate::infrastructure::{tick_until, AgentHarness, RecordingTest};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use netunit::builtin::{BuiltinTest, PayloadSpec, TestDeclaration};
use netunit::codec::{Bunch, BunchCodec, ChannelMessage, ControlCommand, ControlMessage};
use netunit::orchestrator::{TestContext, UnitTest, UnitTestOrchestrator};
use netunit::settings::{UnitTestSettings, VerificationState};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::codec::Framed;

fn builtin(harness: &AgentHarness, name: &str, payload: PayloadSpec) -> UnitTestOrchestrator {
    let declaration = TestDeclaration { settings: harness.client_settings(name), payload };
    harness.orchestrator(BuiltinTest::new(declaration))
}

async fn run_to_verdict(orchestrator: &mut UnitTestOrchestrator) -> Result<VerificationState> {
    orchestrator.execute(Instant::now())?;
    let done = tick_until(orchestrator, Duration::from_secs(10), |o| o.is_done()).await;
    assert!(done, "{} did not conclude", orchestrator.name());
    Ok(orchestrator.verification())
}

/// SendResultCommand output reaches the test and is compared
#[tokio::test]
async fn test_command_result_round_trip() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;

    let payload = PayloadSpec::Command { command: "echo hello agent".into(), expect: Some("agent".into()) };
    let mut orchestrator = builtin(&harness, "EchoCommand", payload);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedFixed);

    let payload = PayloadSpec::Command { command: "echo hello".into(), expect: Some("agent".into()) };
    let mut orchestrator = builtin(&harness, "EchoMismatch", payload);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedUnfixed);

    let payload = PayloadSpec::Command { command: "missing".into(), expect: None };
    let mut orchestrator = builtin(&harness, "UnknownCommand", payload);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedNeedsUpdate);
    Ok(())
}

/// Only the most recent watcher of an event is notified
#[tokio::test]
async fn test_last_event_watcher_wins() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;
    let event = PayloadSpec::Event { event: "MatchStarted".into() };

    let mut first = builtin(&harness, "FirstWatcher", event.clone());
    first.execute(Instant::now())?;
    assert!(tick_until(&mut first, Duration::from_secs(10), |_| harness.agent.watcher_of("MatchStarted").is_some()).await);
    let first_watcher = harness.agent.watcher_of("MatchStarted");

    let mut second = builtin(&harness, "SecondWatcher", event);
    second.execute(Instant::now())?;
    assert!(
        tick_until(&mut second, Duration::from_secs(10), |_| harness.agent.watcher_of("MatchStarted") != first_watcher)
            .await
    );

    assert!(harness.agent.notify_event("MatchStarted"));
    assert!(tick_until(&mut second, Duration::from_secs(10), |o| o.is_done()).await);
    assert_eq!(second.verification(), VerificationState::VerifiedFixed);

    for _ in 0..10 {
        first.tick(Instant::now());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!first.is_done());
    assert_eq!(first.verification(), VerificationState::Unverified);
    first.cleanup(Instant::now());
    Ok(())
}

/// Summon replies with the summoned class
#[tokio::test]
async fn test_summon_reply() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;

    let payload = PayloadSpec::Summon { class: "NUTActor".into(), args: "-ForceBeginPlay".into(), log_pattern: None };
    let mut orchestrator = builtin(&harness, "SummonActor", payload);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedFixed);
    assert!(orchestrator
        .status_log()
        .entries()
        .iter()
        .any(|e| e.message.contains("Summoned NUTActor")));

    let payload = PayloadSpec::Summon { class: "Missing".into(), args: String::new(), log_pattern: None };
    let mut orchestrator = builtin(&harness, "SummonMissing", payload);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedNeedsUpdate);
    Ok(())
}

/// RPCs are transmitted and reach the agent
#[tokio::test]
async fn test_rpc_transmitted() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;

    let payload = PayloadSpec::Rpc { function: "ServerEcho".into(), params: "hi".into() };
    let mut orchestrator = builtin(&harness, "EchoRpc", payload);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedFixed);

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.agent.received_rpcs().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.agent.received_rpcs(), vec![("ServerEcho".to_string(), "hi".to_string())]);
    Ok(())
}

/// The harness self-test answers exactly one ping
#[tokio::test]
async fn test_ping_self_test() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;

    let mut orchestrator = builtin(&harness, "PingSelfTest", PayloadSpec::Ping);
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedFixed);
    assert_eq!(harness.agent.pings_answered(), 1);
    Ok(())
}

/// Pings the agent from its payload, then passes on the command reply.
struct PayloadPing {
    settings: UnitTestSettings,
}

impl UnitTest for PayloadPing {
    fn settings(&self) -> &UnitTestSettings {
        &self.settings
    }

    fn execute_payload(&mut self, ctx: &mut TestContext<'_>) {
        ctx.send_control(ControlCommand::Ping, "");
        ctx.send_control(ControlCommand::SendResultCommand, "echo after ping");
    }

    fn on_command_result(&mut self, ctx: &mut TestContext<'_>, success: bool, _output: &str) {
        let verdict = if success { VerificationState::VerifiedFixed } else { VerificationState::VerifiedUnfixed };
        ctx.verify(verdict, "command answered");
    }
}

/// A Pong answering a Ping sent by the test itself is not a violation
#[tokio::test]
async fn test_payload_ping_answered_without_violation() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;

    let mut orchestrator = harness.orchestrator(PayloadPing { settings: harness.client_settings("PayloadPing") });
    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedFixed);
    assert_eq!(harness.agent.pings_answered(), 1);
    assert!(orchestrator.status_log().entries().iter().any(|e| e.message.contains("Received pong")));
    assert!(!orchestrator
        .status_log()
        .entries()
        .iter()
        .any(|e| e.message.contains("without a pending Ping")));
    Ok(())
}

/// A server that completes the handshake and then sends a Pong nobody asked for.
async fn unsolicited_pong_server() -> Result<(String, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();

    let task = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut framed = Framed::new(stream, BunchCodec::new());
        let _hello = framed.next().await;
        let welcome = ChannelMessage::Welcome { map: "Entry".into(), game: "NullUnitEnv".into() };
        if framed.send(Bunch::Generic(welcome)).await.is_err() {
            return;
        }
        let _join = framed.next().await;
        if framed.send(Bunch::Control(ControlMessage::new(ControlCommand::Pong, ""))).await.is_err() {
            return;
        }
        // Hold the connection open until the client goes away
        while let Some(Ok(_)) = framed.next().await {}
    });
    Ok((address, task))
}

/// An unsolicited Pong is a protocol violation
#[tokio::test]
async fn test_unsolicited_pong_is_protocol_violation() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let harness = AgentHarness::start().await?;
    let (address, server) = unsolicited_pong_server().await.context("Failed to start server")?;

    let settings = UnitTestSettings { server_address: Some(address), ..harness.client_settings("UnsolicitedPong") };
    let (test, _) = RecordingTest::new(settings, |_| {});
    let mut orchestrator = harness.orchestrator(test);

    assert_eq!(run_to_verdict(&mut orchestrator).await?, VerificationState::VerifiedNeedsUpdate);
    assert!(orchestrator
        .status_log()
        .entries()
        .iter()
        .any(|e| e.message.contains("Pong without a pending Ping")));
    server.abort();
    Ok(())
}
