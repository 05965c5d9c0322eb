//! Client facade: session registry, do-not-disturb, revive and presence

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{MockEngine, MockProbe, config, eventually, next_client_event, within};
use webcall_core::events::ClientEvent;
use webcall_core::{
    AcceptOptions, Client, ClientError, ClientStatus, NetworkMonitor, PresenceStatus, RejectOptions, SessionStatus,
    TerminateOptions, TerminationCause,
};

async fn connected_client(engine: &Arc<MockEngine>, network: &NetworkMonitor) -> Client {
    let client = Client::builder(config())
        .engine(engine.clone())
        .probe(MockProbe::new(true))
        .network(network.clone())
        .build()
        .await
        .unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_do_not_disturb_rejects_without_registering() {
    let engine = MockEngine::new();
    let client = Client::builder(config())
        .engine(engine.clone())
        .probe(MockProbe::new(true))
        .do_not_disturb(|| true)
        .build()
        .await
        .unwrap();
    client.connect().await.unwrap();
    let mut events = client.subscribe_events();

    let call = engine.agent().offer_call("in-1", "sip:201@example.com");
    eventually(|| call.calls() == vec!["reject 486".to_string()]).await;

    assert!(client.get_sessions().is_empty());
    assert!(client.get_session("in-1").is_none());
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ClientEvent::SessionAdded { .. } | ClientEvent::Invite { .. }),
            "unexpected {:?}",
            event
        );
    }
}

#[tokio::test]
async fn test_toggling_do_not_disturb() {
    let engine = MockEngine::new();
    let client = connected_client(&engine, &NetworkMonitor::default()).await;
    let mut events = client.subscribe_events();

    client.set_do_not_disturb(true);
    assert!(client.do_not_disturb());
    let busy = engine.agent().offer_call("in-1", "sip:201@example.com");
    eventually(|| busy.count("reject 486") == 1).await;

    client.set_do_not_disturb(false);
    assert!(!client.do_not_disturb());
    engine.agent().offer_call("in-2", "sip:202@example.com");
    let event = next_client_event(&mut events, |e| matches!(e, ClientEvent::Invite { .. })).await;
    match event {
        ClientEvent::Invite { session } => {
            assert_eq!(session.id(), "in-2");
            assert_eq!(session.remote_identity().phone_number, "202");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(client.get_sessions().len(), 1);
}

#[tokio::test]
async fn test_inbound_call_lifecycle() {
    let engine = MockEngine::new();
    let client = connected_client(&engine, &NetworkMonitor::default()).await;
    let mut events = client.subscribe_events();

    let call = engine.agent().offer_call("in-1", "sip:201@example.com");
    let added = next_client_event(&mut events, |e| matches!(e, ClientEvent::SessionAdded { .. })).await;
    assert_eq!(added.session_id(), Some("in-1"));
    let session = match next_client_event(&mut events, |e| matches!(e, ClientEvent::Invite { .. })).await {
        ClientEvent::Invite { session } => session,
        other => panic!("unexpected {:?}", other),
    };
    assert!(client.transport().priority());

    session.accept(AcceptOptions::default()).await.unwrap();
    assert!(session.accepted().await.accepted);
    next_client_event(&mut events, |e| {
        matches!(e, ClientEvent::SessionUpdate { status: SessionStatus::Active, .. })
    })
    .await;

    // accepting twice is harmless, rejecting now is a misuse
    session.accept(AcceptOptions::default()).await.unwrap();
    assert_eq!(call.count("accept"), 1);
    assert!(matches!(
        session.reject(RejectOptions::default()).await,
        Err(ClientError::InvalidOperation { .. })
    ));

    call.hang_up();
    let removed = next_client_event(&mut events, |e| matches!(e, ClientEvent::SessionRemoved { .. })).await;
    match removed {
        ClientEvent::SessionRemoved { session_id, outcome } => {
            assert_eq!(session_id, "in-1");
            assert_eq!(outcome.cause, TerminationCause::RemoteBye);
            assert!(outcome.said_bye);
            assert!(outcome.answered_at.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.get_sessions().is_empty());
    assert!(!client.transport().priority());
    assert!(session.said_bye());
}

#[tokio::test]
async fn test_outbound_call_terminated_once() {
    let engine = MockEngine::new();
    let client = connected_client(&engine, &NetworkMonitor::default()).await;
    let mut events = client.subscribe_events();

    let session = client.invite("201").await.unwrap();
    assert_eq!(session.status(), SessionStatus::Ringing);
    assert!(client.get_session(session.id()).is_some());
    let call = engine.agent().sessions.lock()[0].clone();
    assert_eq!(call.calls(), Vec::<String>::new());

    let (first, second) = tokio::join!(
        session.terminate(TerminateOptions::default()),
        session.terminate(TerminateOptions::default())
    );
    assert_eq!(first.cause, TerminationCause::Cancelled);
    assert_eq!(second.cause, TerminationCause::Cancelled);
    assert_eq!(call.count("cancel"), 1);
    assert_eq!(session.terminated().await.cause, TerminationCause::Cancelled);

    next_client_event(&mut events, |e| matches!(e, ClientEvent::SessionRemoved { .. })).await;
    assert!(client.get_sessions().is_empty());
}

#[tokio::test]
async fn test_answered_outbound_call_hangs_up_with_bye() {
    let engine = MockEngine::new();
    let client = connected_client(&engine, &NetworkMonitor::default()).await;

    let session = client.invite("sip:201@example.com").await.unwrap();
    let call = engine.agent().sessions.lock()[0].clone();
    call.answer();
    assert!(within(session.accepted()).await.accepted);
    assert_eq!(session.status(), SessionStatus::Active);

    let outcome = session.terminate(TerminateOptions::default()).await;
    assert_eq!(outcome.cause, TerminationCause::LocalHangup);
    assert!(!outcome.said_bye);
    assert_eq!(call.count("bye"), 1);

    eventually(|| client.get_sessions().is_empty()).await;
}

#[tokio::test]
async fn test_sessions_and_subscriptions_revived_after_outage() {
    let engine = MockEngine::new();
    let network = NetworkMonitor::default();
    let client = connected_client(&engine, &network).await;
    let mut events = client.subscribe_events();

    client.subscribe("201").await.unwrap();
    let first_agent = engine.agent();
    let first_subscription = first_agent.subscription("sip:201@example.com").unwrap();

    let call = first_agent.offer_call("in-1", "sip:202@example.com");
    let session = match next_client_event(&mut events, |e| matches!(e, ClientEvent::Invite { .. })).await {
        ClientEvent::Invite { session } => session,
        other => panic!("unexpected {:?}", other),
    };
    session.accept(AcceptOptions::default()).await.unwrap();

    network.set_online(false);
    next_client_event(&mut events, |e| {
        matches!(e, ClientEvent::StatusUpdate { status: ClientStatus::Dying, .. })
    })
    .await;
    network.set_online(true);
    next_client_event(&mut events, |e| {
        matches!(e, ClientEvent::StatusUpdate { status: ClientStatus::Connected, .. })
    })
    .await;

    eventually(|| call.count("reinvite hold=false ice_restart=true") == 1).await;
    let second_agent = engine.agent();
    eventually(|| second_agent.subscription("sip:201@example.com").is_some()).await;
    let renewed = second_agent.subscription("sip:201@example.com").unwrap();
    eventually(|| renewed.subscribes.load(Ordering::SeqCst) == 1).await;
    eventually(|| first_subscription.disposed.load(Ordering::SeqCst)).await;
    assert_eq!(session.status(), SessionStatus::Active);
}

#[tokio::test]
async fn test_presence_follows_notifications() {
    let engine = MockEngine::new();
    let client = connected_client(&engine, &NetworkMonitor::default()).await;
    let mut events = client.subscribe_events();

    client.subscribe("201").await.unwrap();
    // a second subscribe to the same contact is a no-op
    client.subscribe("sip:201@EXAMPLE.com").await.unwrap();
    let subscription = engine.agent().subscription("sip:201@example.com").unwrap();
    assert_eq!(engine.agent().subscriptions.lock().len(), 1);
    assert_eq!(client.presence("201"), Some(PresenceStatus::Unknown));

    subscription.notify("confirmed");
    match next_client_event(&mut events, |e| matches!(e, ClientEvent::SubscriptionNotify { .. })).await {
        ClientEvent::SubscriptionNotify { uri, status } => {
            assert_eq!(uri, "sip:201@example.com");
            assert_eq!(status, PresenceStatus::Busy);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(client.presence("201"), Some(PresenceStatus::Busy));

    subscription.notify("early");
    next_client_event(&mut events, |e| {
        matches!(e, ClientEvent::SubscriptionNotify { status: PresenceStatus::Ringing, .. })
    })
    .await;

    client.unsubscribe("201");
    assert_eq!(client.presence("201"), None);
    eventually(|| subscription.unsubscribes.load(Ordering::SeqCst) == 1).await;
    eventually(|| subscription.disposed.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn test_operations_need_a_connection() {
    let engine = MockEngine::new();
    let client = Client::builder(config())
        .engine(engine.clone())
        .probe(MockProbe::new(true))
        .build()
        .await
        .unwrap();

    assert_eq!(client.status(), ClientStatus::Disconnected);
    assert!(matches!(client.invite("201").await, Err(ClientError::NotConnected)));
    assert!(matches!(client.subscribe("201").await, Err(ClientError::NotConnected)));
    assert!(matches!(
        client.attended_transfer("a", "b").await,
        Err(ClientError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_builder_requires_an_engine() {
    let result = Client::builder(config()).build().await;
    assert!(matches!(result, Err(ClientError::InvalidConfiguration { .. })));
}

#[tokio::test]
async fn test_attended_transfer_between_registered_sessions() {
    let engine = MockEngine::new();
    let client = connected_client(&engine, &NetworkMonitor::default()).await;

    let a = client.invite("201").await.unwrap();
    let b = client.invite("202").await.unwrap();
    let agent = engine.agent();
    let (call_a, call_b) = {
        let sessions = agent.sessions.lock();
        (sessions[0].clone(), sessions[1].clone())
    };
    call_a.answer();
    call_b.answer();
    within(a.accepted()).await;
    within(b.accepted()).await;

    client.attended_transfer(a.id(), b.id()).await.unwrap();
    assert_eq!(call_a.calls(), vec![format!("refer Session({:?})", b.id())]);

    client.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.status(), ClientStatus::Disconnected);
}
