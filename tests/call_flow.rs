//! Two-party call flows over the in-memory signaling broker
//!
//! Both participants run real peer connections inside the test process and
//! connect over loopback host candidates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telecare_rtc::{
    CallConfig, CallDescriptor, CallPhase, CallRole, CallSession, Error, MemorySignaling,
    SignalingChannel, SignalingMessage, SyntheticMediaSource,
};
use tokio::sync::mpsc;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn descriptor(session_id: &str, local: &str, remote: &str, role: CallRole) -> CallDescriptor {
    CallDescriptor {
        session_id: session_id.to_string(),
        local_participant_id: local.to_string(),
        remote_participant_id: remote.to_string(),
        role,
    }
}

fn session(
    broker: &MemorySignaling,
    session_id: &str,
    local: &str,
    remote: &str,
    role: CallRole,
) -> CallSession {
    CallSession::new(
        descriptor(session_id, local, remote, role),
        CallConfig::default(),
        Arc::new(broker.clone()),
        Arc::new(SyntheticMediaSource::new()),
    )
    .expect("valid session")
}

async fn wait_until(
    session: &CallSession,
    what: &str,
    timeout: Duration,
    mut pred: impl FnMut(&telecare_rtc::CallSessionState) -> bool,
) {
    let mut states = session.subscribe_state();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred(&session.state()) {
            return;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for {what}, still {:?}", session.state().phase);
        }
        match tokio::time::timeout(remaining, states.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => panic!("state channel closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}, still {:?}", session.state().phase),
        }
    }
}

async fn wait_for_phase(session: &CallSession, want: CallPhase, timeout: Duration) {
    wait_until(session, "phase", timeout, |state| state.phase == want).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_party_call_connects_and_ends() {
    init_tracing();
    let broker = MemorySignaling::new();

    let patient = session(&broker, "consult-1", "patient", "physician", CallRole::Initiator);
    let physician = session(&broker, "consult-1", "physician", "patient", CallRole::Responder);

    // The initiator subscribes first so the responder's readiness
    // announcement is not lost.
    patient.start().await.expect("patient start");
    physician.start().await.expect("physician start");

    wait_for_phase(&patient, CallPhase::Connected, CONNECT_TIMEOUT).await;
    wait_for_phase(&physician, CallPhase::Connected, CONNECT_TIMEOUT).await;

    let patient_stream = patient.state().local_stream.expect("patient local stream");
    assert!(patient_stream.audio().is_some());
    assert!(patient_stream.video().is_some());

    // Hanging up on one side converges both.
    patient.end().await;
    assert_eq!(patient.state().phase, CallPhase::Ended);
    wait_for_phase(&physician, CallPhase::Ended, Duration::from_secs(10)).await;

    // The single most important invariant: the webcam light is off.
    for track in patient_stream.tracks() {
        assert!(track.is_stopped());
    }
    physician.end().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_responder_still_connects() {
    init_tracing();
    let broker = MemorySignaling::new();

    let physician = session(&broker, "consult-2", "physician", "patient", CallRole::Responder);
    physician.start().await.expect("physician start");

    // The responder announced before the initiator subscribed; the repeat
    // announcement triggered by the initiator's own `ready` recovers the
    // handshake.
    let patient = session(&broker, "consult-2", "patient", "physician", CallRole::Initiator);
    patient.start().await.expect("patient start");

    wait_for_phase(&patient, CallPhase::Connected, CONNECT_TIMEOUT).await;
    wait_for_phase(&physician, CallPhase::Connected, CONNECT_TIMEOUT).await;

    patient.end().await;
    physician.end().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_reconnect_keeps_local_media() {
    init_tracing();
    let broker = MemorySignaling::new();

    let patient = session(&broker, "consult-3", "patient", "physician", CallRole::Initiator);
    let physician = session(&broker, "consult-3", "physician", "patient", CallRole::Responder);

    patient.start().await.expect("patient start");
    physician.start().await.expect("physician start");
    wait_for_phase(&patient, CallPhase::Connected, CONNECT_TIMEOUT).await;
    wait_for_phase(&physician, CallPhase::Connected, CONNECT_TIMEOUT).await;

    // The remote stream id matches the connection instance that produced it.
    wait_until(&patient, "first remote stream", CONNECT_TIMEOUT, |state| {
        state.remote_stream.is_some()
    })
    .await;
    let stream_before = patient.state().local_stream.expect("local stream");
    let remote_before = patient.state().remote_stream.expect("remote stream");

    patient.reconnect();
    // The connection is replaced in place: a fresh remote stream from a new
    // connection instance appears and the call returns to Connected.
    wait_until(&patient, "replacement remote stream", CONNECT_TIMEOUT, |state| {
        state.phase == CallPhase::Connected
            && state
                .remote_stream
                .as_ref()
                .map(|s| s.id() != remote_before.id())
                .unwrap_or(false)
    })
    .await;
    wait_for_phase(&physician, CallPhase::Connected, CONNECT_TIMEOUT).await;

    let stream_after = patient.state().local_stream.expect("local stream");
    assert_eq!(stream_before.id(), stream_after.id());
    for track in stream_after.tracks() {
        assert!(!track.is_stopped());
    }

    patient.end().await;
    physician.end().await;
}

/// Signaling wrapper that fails the first N sends
struct FlakySignaling {
    inner: MemorySignaling,
    failures_left: AtomicU32,
}

#[async_trait::async_trait]
impl SignalingChannel for FlakySignaling {
    async fn subscribe(
        &self,
        session_id: &str,
    ) -> telecare_rtc::Result<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.inner.subscribe(session_id).await
    }

    async fn send(&self, session_id: &str, message: SignalingMessage) -> telecare_rtc::Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::SignalingSendFailed("injected outage".to_string()));
        }
        self.inner.send(session_id, message).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_send_failures_are_retried_on_start() {
    init_tracing();
    let broker = MemorySignaling::new();
    let flaky = Arc::new(FlakySignaling {
        inner: broker.clone(),
        failures_left: AtomicU32::new(2),
    });

    let patient = CallSession::new(
        descriptor("consult-4", "patient", "physician", CallRole::Initiator),
        CallConfig::default(),
        flaky,
        Arc::new(SyntheticMediaSource::new()),
    )
    .expect("valid session");

    // Two injected failures sit inside the retry budget, so the readiness
    // broadcast still goes out.
    patient.start().await.expect("start despite flaky channel");
    assert_eq!(patient.state().phase, CallPhase::Signaling);

    patient.end().await;
    assert_eq!(patient.state().phase, CallPhase::Ended);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ending_an_unanswered_call_is_clean() {
    init_tracing();
    let broker = MemorySignaling::new();
    let patient = session(&broker, "consult-5", "patient", "physician", CallRole::Initiator);

    patient.start().await.expect("patient start");
    assert_eq!(patient.state().phase, CallPhase::Signaling);
    let stream = patient.state().local_stream.expect("local stream");

    patient.end().await;
    assert_eq!(patient.state().phase, CallPhase::Ended);
    for track in stream.tracks() {
        assert!(track.is_stopped());
    }
}
