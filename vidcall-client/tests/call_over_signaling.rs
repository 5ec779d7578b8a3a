use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use vidcall_client::app::spawn_signaling_bridge;
use vidcall_client::call::{CallEvent, CallHandle, CallSession, CallState, SessionConfig};
use vidcall_client::error::EndReason;
use vidcall_client::test_utils::{FakeConnector, PeerCall, eventually};
use vidcall_protocol::ws::{IceCandidate, SdpType, SignalingMessage};
use vidcall_signaling::client::SignalingClient;
use vidcall_signaling::transport::mock::MockTransport;
use vidcall_webrtc::config::MediaConfig;
use vidcall_webrtc::{MediaSource, PeerEvent};

type Endpoints = Arc<Mutex<BTreeMap<String, MockTransport>>>;

/// Relays messages between mock transports the way the relay server does: join-room registers
/// the endpoint and rebroadcasts the user list, everything else is forwarded to `to`.
fn attach_to_relay(endpoints: &Endpoints, transport: &MockTransport) {
    let endpoints = endpoints.clone();
    let own = transport.clone();
    let mut outgoing_rx = transport.outgoing_tx.subscribe();

    tokio::spawn(async move {
        loop {
            let msg = match outgoing_rx.recv().await {
                Ok(tungstenite::Message::Text(text)) => {
                    SignalingMessage::deserialize(&text).unwrap()
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };

            let mut endpoints = endpoints.lock();
            match msg {
                SignalingMessage::JoinRoom { id } => {
                    endpoints.insert(id, own.clone());
                    let list = SignalingMessage::UserList {
                        ids: endpoints.keys().cloned().collect(),
                    };
                    for endpoint in endpoints.values() {
                        endpoint.deliver(&list);
                    }
                }
                other => {
                    if let Some(endpoint) = other.to().and_then(|to| endpoints.get(to)) {
                        endpoint.deliver(&other);
                    }
                }
            }
        }
    });
}

struct Endpoint {
    handle: CallHandle,
    connector: FakeConnector,
    _signaling: SignalingClient<MockTransport>,
}

async fn endpoint(endpoints: &Endpoints, id: &str, shutdown_token: &CancellationToken) -> Endpoint {
    let transport = MockTransport::default();
    attach_to_relay(endpoints, &transport);

    let signaling = SignalingClient::new(
        transport,
        id,
        shutdown_token.clone(),
        0,
        &tokio::runtime::Handle::current(),
    );
    let connector = FakeConnector::default();
    let handle = CallSession::spawn(
        SessionConfig {
            identity: id.to_string(),
            ring_timeout: Some(Duration::from_secs(30)),
            event_channel_size: 64,
        },
        connector.clone(),
        signaling.clone(),
        MediaSource::acquire(&MediaConfig::default()).unwrap(),
        shutdown_token.clone(),
        &tokio::runtime::Handle::current(),
    );
    spawn_signaling_bridge(&signaling, handle.clone(), shutdown_token.clone());
    signaling.connect().await.unwrap();

    Endpoint {
        handle,
        connector,
        _signaling: signaling,
    }
}

#[test(tokio::test)]
async fn full_call_between_two_endpoints() {
    let endpoints = Endpoints::default();
    let shutdown_token = CancellationToken::new();
    let alice = endpoint(&endpoints, "alice", &shutdown_token).await;
    let bob = endpoint(&endpoints, "bob", &shutdown_token).await;
    let mut bob_events = bob.handle.subscribe();

    assert!(eventually(|| alice.handle.roster().is_reachable("bob")).await);
    assert!(eventually(|| bob.handle.roster().is_reachable("alice")).await);

    alice.handle.call("bob").await.unwrap();
    assert!(eventually(|| bob.handle.state() == CallState::Offered).await);
    assert_eq!(alice.handle.state(), CallState::Ringing);

    let incoming = loop {
        match bob_events.recv().await.unwrap() {
            CallEvent::IncomingCall { peer_id } => break peer_id,
            _ => continue,
        }
    };
    assert_eq!(incoming, "alice");

    bob.handle.answer().await.unwrap();
    assert!(eventually(|| alice.handle.state() == CallState::Active).await);
    assert_eq!(bob.handle.state(), CallState::Active);
    assert!(
        eventually(|| alice
            .connector
            .calls()
            .contains(&PeerCall::SetRemoteDescription(SdpType::Answer)))
        .await
    );

    let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host");
    assert!(alice.connector.emit(PeerEvent::IceCandidate(candidate.clone())));
    assert!(eventually(|| bob.connector.candidates() == vec![candidate.clone()]).await);

    alice.handle.end_call().await.unwrap();
    assert!(eventually(|| bob.handle.state() == CallState::Idle).await);
    assert_eq!(alice.handle.state(), CallState::Idle);

    let ended = loop {
        match bob_events.recv().await.unwrap() {
            CallEvent::Ended { reason, .. } => break reason,
            _ => continue,
        }
    };
    assert_eq!(ended, EndReason::RemoteHangup);

    shutdown_token.cancel();
}

#[test(tokio::test)]
async fn declined_call_returns_both_to_idle() {
    let endpoints = Endpoints::default();
    let shutdown_token = CancellationToken::new();
    let alice = endpoint(&endpoints, "alice", &shutdown_token).await;
    let bob = endpoint(&endpoints, "bob", &shutdown_token).await;
    let mut alice_events = alice.handle.subscribe();

    assert!(eventually(|| alice.handle.roster().is_reachable("bob")).await);
    alice.handle.call("bob").await.unwrap();
    assert!(eventually(|| bob.handle.state() == CallState::Offered).await);

    bob.handle.reject().await.unwrap();

    assert!(eventually(|| alice.handle.state() == CallState::Idle).await);
    let ended = loop {
        match alice_events.recv().await.unwrap() {
            CallEvent::Ended { reason, .. } => break reason,
            _ => continue,
        }
    };
    assert_eq!(ended, EndReason::Declined);
    assert_eq!(bob.handle.state(), CallState::Idle);

    shutdown_token.cancel();
}

#[test(tokio::test)]
async fn third_caller_gets_busy() {
    let endpoints = Endpoints::default();
    let shutdown_token = CancellationToken::new();
    let alice = endpoint(&endpoints, "alice", &shutdown_token).await;
    let bob = endpoint(&endpoints, "bob", &shutdown_token).await;
    let carol = endpoint(&endpoints, "carol", &shutdown_token).await;
    let mut carol_events = carol.handle.subscribe();

    assert!(eventually(|| alice.handle.roster().len() == 2).await);
    assert!(eventually(|| carol.handle.roster().is_reachable("bob")).await);

    alice.handle.call("bob").await.unwrap();
    assert!(eventually(|| bob.handle.state() == CallState::Offered).await);

    carol.handle.call("bob").await.unwrap();

    let ended = loop {
        match carol_events.recv().await.unwrap() {
            CallEvent::Ended { reason, .. } => break reason,
            _ => continue,
        }
    };
    assert_eq!(ended, EndReason::Busy);
    assert_eq!(bob.handle.status().await.unwrap().peer_id.as_deref(), Some("alice"));

    shutdown_token.cancel();
}
