//! Integration tests: a real client against the in-memory backend.

use nimbus_codec::{EncodedValue, TypeTag};
use nimbus_protocol::{
    DataUpdateMessage, DeltaData, EventMessage, Property, ProtocolError, PushEnvelope, RequestKind,
    ServerMessage,
};
use nimbus_runtime::{
    ClassRegistry, Client, ConnectionError, Credentials, PlatformErrorCode, RuntimeConfig,
    RuntimeError, ServiceIdentity, TransportPool, Value,
};
use nimbus_testkit::init_tracing;
use nimbus_testkit::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..2500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

fn kinds(backend: &FakeBackend) -> Vec<RequestKind> {
    backend.requests().iter().map(|r| r.kind()).collect()
}

fn backend() -> FakeBackend {
    init_tracing();
    FakeBackend::start(service())
}

#[tokio::test]
async fn get_data_populates_and_reuses_the_cached_instance() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 3, vec![text("name", "Sam")]);
    let client = client_for(&backend);
    let key = user_key(&client, "u1");

    let user = client.get_data(&key).await.unwrap().unwrap();
    assert_eq!(user.view().get_str("name").as_deref(), Some("Sam"));
    assert_eq!(client.state().identity().try_get_version(&user), Some(3));

    let again = client.get_data(&key).await.unwrap().unwrap();
    assert_eq!(again, user);
    assert_eq!(kinds(&backend), vec![RequestKind::GetData, RequestKind::GetData]);
}

#[tokio::test]
async fn get_data_of_missing_record_is_none() {
    let backend = backend();
    let client = client_for(&backend);
    let found = client.get_data(&user_key(&client, "ghost")).await.unwrap();
    assert!(found.is_none());
    assert!(client.state().identity().is_empty());
}

#[tokio::test]
async fn call_method_resolves_a_returned_reference() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 2, vec![text("name", "Sam")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    backend.on_method(1, move |call| {
        sink.lock().extend(call.arguments.clone());
        MethodOutcome::value(record_ref(USER_CLASS, "u1"))
    });
    let client = client_for(&backend);
    let api = client.callable("Api", "api").unwrap();

    let value = client
        .call_method(&api, 1, vec![Value::from("hello")])
        .await
        .unwrap();

    let Value::Record(user) = value else {
        panic!("expected a record");
    };
    assert_eq!(user.primary_key(), "u1");
    assert_eq!(user.view().get_str("name").as_deref(), Some("Sam"));
    assert_eq!(*seen.lock(), vec![EncodedValue::string("hello")]);
    assert_eq!(kinds(&backend), vec![RequestKind::CallMethod, RequestKind::GetData]);
}

#[tokio::test]
async fn joint_map_entry_appears_once_both_sides_are_fetched() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    backend.put_record(POST_CLASS, "p1", 4, vec![text("title", "Hello")]);
    backend.on_method(1, |_| {
        MethodOutcome::value(EncodedValue::map([(
            record_ref(USER_CLASS, "u1"),
            record_ref(POST_CLASS, "p1"),
        )]))
    });
    let client = client_for(&backend);
    let api = client.callable("Api", "api").unwrap();

    let value = client.call_method(&api, 1, Vec::new()).await.unwrap();
    let map = value.as_map().unwrap();
    let entries = map.entries();
    assert_eq!(entries.len(), 1);
    let (Value::Record(user), Value::Record(post)) = &entries[0] else {
        panic!("expected record key and value");
    };
    assert_eq!(user.view().get_str("name").as_deref(), Some("Sam"));
    assert_eq!(post.view().get_str("title").as_deref(), Some("Hello"));
}

#[tokio::test]
async fn bundled_events_are_delivered_before_bundled_updates() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    let client = client_for(&backend);
    let user = client.get_data(&user_key(&client, "u1")).await.unwrap().unwrap();
    let api = client.callable("Api", "api").unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    client
        .subscribe_updates(&user, move |_, _| {
            log.lock().push("update");
            Ok(())
        })
        .await
        .unwrap();
    let log = Arc::clone(&order);
    client
        .subscribe_event("Ping", &api, move |_| {
            log.lock().push("event");
            Ok(())
        })
        .await
        .unwrap();

    let server = backend.clone();
    backend.on_method(7, move |_| {
        let delta = server.update_record(USER_CLASS, "u1", vec![text("name", "Kim")]);
        MethodOutcome::with_messages(
            EncodedValue::undefined(),
            vec![
                ServerMessage::DataUpdate(DataUpdateMessage {
                    deltas: vec![delta],
                }),
                ServerMessage::Event(EventMessage {
                    class_id: PING_EVENT,
                    source: callable_ref(API_CLASS, "api"),
                    properties: vec![text("msg", "hi")],
                    deltas: Vec::new(),
                }),
            ],
        )
    });

    let value = client.call_method(&api, 7, Vec::new()).await.unwrap();
    assert!(value.is_undefined());
    assert_eq!(*order.lock(), vec!["event", "update"]);
    assert_eq!(user.view().get_str("name").as_deref(), Some("Kim"));
    assert_eq!(client.state().identity().try_get_version(&user), Some(2));
}

#[tokio::test]
async fn a_malformed_bundled_message_applies_nothing() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    let client = client_for(&backend);
    let user = client.get_data(&user_key(&client, "u1")).await.unwrap().unwrap();
    let api = client.callable("Api", "api").unwrap();

    let events = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&events);
    client
        .subscribe_event("Ping", &api, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let server = backend.clone();
    backend.on_method(7, move |_| {
        let delta = server.update_record(USER_CLASS, "u1", vec![text("name", "Kim")]);
        let broken = DeltaData::update(
            USER_CLASS,
            "u2",
            1,
            vec![Property::new("n", EncodedValue::new(TypeTag::Number, vec![0xff]))],
        );
        MethodOutcome::with_messages(
            EncodedValue::undefined(),
            vec![
                ServerMessage::Event(EventMessage {
                    class_id: PING_EVENT,
                    source: callable_ref(API_CLASS, "api"),
                    properties: vec![text("msg", "hi")],
                    deltas: Vec::new(),
                }),
                ServerMessage::DataUpdate(DataUpdateMessage {
                    deltas: vec![delta, broken],
                }),
            ],
        )
    });

    assert!(client.call_method(&api, 7, Vec::new()).await.is_err());
    assert_eq!(events.load(Ordering::SeqCst), 0);
    assert_eq!(user.view().get_str("name").as_deref(), Some("Sam"));
    assert_eq!(client.state().identity().try_get_version(&user), Some(1));
}

#[tokio::test]
async fn remote_failures_map_to_one_error_kind() {
    let backend = backend();
    backend.on_method(2, |_| MethodOutcome::exception("boom", "at handler (api.js:3)"));
    backend.on_method(3, |_| MethodOutcome::Error(PlatformErrorCode::Forbidden.code()));
    let client = client_for(&backend);
    let api = client.callable("Api", "api").unwrap();

    let err = client.call_method(&api, 2, Vec::new()).await.unwrap_err();
    assert_eq!(
        err,
        RuntimeError::Script {
            message: "boom".into(),
            stack: "at handler (api.js:3)".into(),
        }
    );

    let err = client.call_method(&api, 3, Vec::new()).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Platform {
            code: PlatformErrorCode::Forbidden,
            raw_code: 3,
            ..
        }
    ));

    let err = client.call_method(&api, 99, Vec::new()).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Platform {
            code: PlatformErrorCode::InvalidRequest,
            ..
        }
    ));
}

#[tokio::test]
async fn save_adopts_local_records_and_advances_versions() {
    let backend = backend();
    let client = client_for(&backend);
    let author = client.create_record("User", "u9").unwrap();
    author.view().set("name", "Ada");
    let post = client.create_record("Post", "p1").unwrap();
    post.view().set("title", "Hello");
    post.view().set("author", author.clone());

    client.save_data(&[post.clone()]).await.unwrap();

    let identity = client.state().identity();
    assert_eq!(identity.try_get_version(&post), Some(1));
    assert_eq!(identity.try_get_version(&author), Some(1));
    assert_eq!(
        identity.try_get_instance(&client.record_key("Post", "p1").unwrap()),
        Some(post.clone())
    );
    assert_eq!(post.view().get("author"), Some(Value::from(author.clone())));
    assert_eq!(backend.record(USER_CLASS, "u9").unwrap().version, 1);

    post.view().set("title", "Edited");
    post.view().remove("author");
    client.save_data(&[post.clone()]).await.unwrap();
    assert_eq!(identity.try_get_version(&post), Some(2));
    let stored = backend.record(POST_CLASS, "p1").unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.properties, vec![text("title", "Edited")]);
    assert!(!post.view().contains("author"));
}

#[tokio::test]
async fn stale_save_is_a_retryable_write_conflict() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    let client = client_for(&backend);
    let user = client.get_data(&user_key(&client, "u1")).await.unwrap().unwrap();
    backend.update_record(USER_CLASS, "u1", vec![text("name", "Kim")]);

    user.view().set("name", "Max");
    let err = client.save_data(&[user]).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Platform {
            code: PlatformErrorCode::WriteConflict,
            ..
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn duplicate_keys_are_rejected_before_sending() {
    let backend = backend();
    let client = client_for(&backend);
    let other = client_for(&backend);
    let mine = client.create_record("User", "u1").unwrap();
    let theirs = other.create_record("User", "u1").unwrap();

    let err = client.save_data(&[mine.clone(), mine.clone()]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::LocalValidation(_)));
    let err = client.save_data(&[mine, theirs]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::LocalValidation(_)));
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn cross_service_save_is_rejected_before_sending() {
    let backend = backend();
    let client = client_for(&backend);
    let foreign_service = ServiceIdentity::new("billing", "v1");
    let foreign_registry = ClassRegistry::builder(foreign_service.clone())
        .record("User", USER_CLASS)
        .unwrap()
        .build();
    let pool = TransportPool::new(Arc::new(backend.connector()));
    let foreign = Client::new(
        RuntimeConfig::new(foreign_service, "mem://billing", Credentials::user("k")),
        foreign_registry,
        &pool,
    )
    .unwrap();

    let mine = client.create_record("User", "u1").unwrap();
    let theirs = foreign.create_record("User", "u2").unwrap();
    let err = client.save_data(&[mine, theirs]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::LocalValidation(_)));
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn registry_must_match_config() {
    let backend = backend();
    let pool = TransportPool::new(Arc::new(backend.connector()));
    let config = RuntimeConfig::new(
        ServiceIdentity::new(SERVICE_ID, "v2"),
        "mem://chat",
        Credentials::user("k"),
    );
    let err = Client::new(config, registry(), &pool).unwrap_err();
    assert!(matches!(err, RuntimeError::LocalValidation(_)));
}

#[tokio::test]
async fn event_subscriptions_share_one_remote_subscription() {
    let backend = backend();
    let client = client_for(&backend);
    let api = client.callable("Api", "api").unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(Mutex::new(Vec::new()));

    let count = Arc::clone(&delivered);
    let first = client
        .subscribe_event("Ping", &api, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    let count = Arc::clone(&delivered);
    let log = Arc::clone(&messages);
    let second = client
        .subscribe_event("Ping", &api, move |event| {
            count.fetch_add(1, Ordering::SeqCst);
            log.lock().push(event.properties.get("msg").cloned());
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(kinds(&backend), vec![RequestKind::SubscribeEvent]);
    assert!(backend.is_event_subscribed(PING_EVENT, &callable_ref(API_CLASS, "api")));

    backend.push(ServerMessage::Event(EventMessage {
        class_id: PING_EVENT,
        source: callable_ref(API_CLASS, "api"),
        properties: vec![text("msg", "hi")],
        deltas: Vec::new(),
    }));
    eventually("both listeners", || delivered.load(Ordering::SeqCst) == 2).await;
    assert_eq!(*messages.lock(), vec![Some(Value::from("hi"))]);

    client.unsubscribe_event(&first).await.unwrap();
    assert_eq!(backend.request_count(), 1);
    client.unsubscribe_event(&second).await.unwrap();
    assert_eq!(
        kinds(&backend),
        vec![RequestKind::SubscribeEvent, RequestKind::UnsubscribeEvent]
    );
    assert!(!backend.is_event_subscribed(PING_EVENT, &callable_ref(API_CLASS, "api")));
}

#[tokio::test]
async fn pushed_updates_and_deletions_reach_update_listeners() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    let client = client_for(&backend);
    let key = user_key(&client, "u1");
    let user = client.get_data(&key).await.unwrap().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer = client.clone();
    let observed_key = key.clone();
    let id = client
        .subscribe_updates(&user, move |_, deleted| {
            let cached = observer
                .state()
                .identity()
                .try_get_instance(&observed_key)
                .is_some();
            sink.lock().push((deleted, cached));
            Ok(())
        })
        .await
        .unwrap();
    assert!(backend.is_record_subscribed(USER_CLASS, "u1"));

    let delta = backend.update_record(USER_CLASS, "u1", vec![text("name", "Kim")]);
    backend.push_update(vec![delta]);
    eventually("update", || seen.lock().len() == 1).await;
    assert_eq!(user.view().get_str("name").as_deref(), Some("Kim"));

    let deletion = backend.delete_record(USER_CLASS, "u1");
    backend.push_update(vec![deletion]);
    eventually("deletion", || seen.lock().len() == 2).await;
    assert_eq!(*seen.lock(), vec![(false, true), (true, true)]);
    assert!(client.state().identity().try_get_instance(&key).is_none());

    // The deletion dropped the listener table along with the entry.
    client.unsubscribe_updates(&user, id).await.unwrap();
    assert!(backend.is_record_subscribed(USER_CLASS, "u1"));
}

#[tokio::test]
async fn version_gap_in_a_push_refetches_the_record() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    let client = client_for(&backend);
    let key = user_key(&client, "u1");
    let stale = client.get_data(&key).await.unwrap().unwrap();

    backend.put_record(USER_CLASS, "u1", 5, vec![text("name", "Zed")]);
    backend.push_update(vec![DeltaData::update(
        USER_CLASS,
        "u1",
        5,
        vec![text("name", "Zed")],
    )]);

    let identity = client.state().identity();
    eventually("refetch", || {
        identity
            .try_get_instance(&key)
            .is_some_and(|i| identity.try_get_version(&i) == Some(5))
    })
    .await;
    let fresh = identity.try_get_instance(&key).unwrap();
    assert_ne!(fresh, stale);
    assert_eq!(fresh.view().get_str("name").as_deref(), Some("Zed"));
    assert_eq!(stale.view().get_str("name").as_deref(), Some("Sam"));
    assert_eq!(kinds(&backend), vec![RequestKind::GetData, RequestKind::GetData]);
}

#[tokio::test]
async fn pushes_for_another_service_build_become_faults() {
    let backend = backend();
    let client = client_for(&backend);
    let mut faults = client.take_faults().unwrap();
    assert!(client.take_faults().is_none());
    client.connect().await.unwrap();
    eventually("backend to accept", || backend.connection_count() == 1).await;

    backend.push_envelope(PushEnvelope {
        log_context: "old".into(),
        service_id: SERVICE_ID.into(),
        service_version: "v0".into(),
        payload: ServerMessage::DataUpdate(DataUpdateMessage {
            deltas: vec![DeltaData::update(USER_CLASS, "u1", 1, vec![text("name", "Old")])],
        }),
    });
    let fault = faults.recv().await.unwrap();
    assert!(matches!(fault, RuntimeError::LocalValidation(_)));
    assert!(client.state().identity().is_empty());

    backend.push_raw(vec![0xff]);
    let fault = faults.recv().await.unwrap();
    assert!(matches!(fault, RuntimeError::Protocol(_)));
}

#[tokio::test]
async fn transport_fails_fast_and_reconnects_lazily() {
    let backend = backend();
    backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
    let pool = TransportPool::new(Arc::new(backend.connector()));
    let client = Client::new(config(), registry(), &pool).unwrap();
    let transport = pool.get(&config());

    let err = transport.send(bytes::Bytes::from_static(b"x")).await.unwrap_err();
    assert_eq!(err, RuntimeError::Connection(ConnectionError::NotReady));

    let key = user_key(&client, "u1");
    client.get_data(&key).await.unwrap();
    assert!(transport.is_ready());

    backend.drop_connections();
    eventually("channel to close", || !transport.is_ready()).await;

    client.get_data(&key).await.unwrap();
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn outstanding_requests_fail_when_the_channel_closes() {
    let backend = backend();
    backend.on_method(1, |_| MethodOutcome::value(EncodedValue::null()));
    let client = client_for(&backend);
    let api = client.callable("Api", "api").unwrap();
    client.connect().await.unwrap();
    backend.set_unresponsive(true);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call_method(&api, 1, Vec::new()).await }
    });
    backend.wait_for_requests(1).await;
    backend.drop_connections();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, RuntimeError::Connection(ConnectionError::Closed));
}

#[tokio::test]
async fn response_protocol_version_must_match() {
    let backend = backend();
    backend.set_response_version(Some(2));
    let client = client_for(&backend);
    let err = client
        .get_data(&user_key(&client, "u1"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::Protocol(ProtocolError::VersionMismatch {
            local: 1,
            remote: 2
        })
    );
}

#[tokio::test]
async fn wrong_service_build_is_a_platform_error() {
    let backend = backend();
    let service = ServiceIdentity::new(SERVICE_ID, "v2");
    let registry = ClassRegistry::builder(service.clone())
        .record("User", USER_CLASS)
        .unwrap()
        .build();
    let pool = TransportPool::new(Arc::new(backend.connector()));
    let client = Client::new(
        RuntimeConfig::new(service, "mem://chat", Credentials::user("k")),
        registry,
        &pool,
    )
    .unwrap();

    let err = client
        .get_data(&client.record_key("User", "u1").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Platform {
            code: PlatformErrorCode::ServiceMismatch,
            ..
        }
    ));
}

#[tokio::test]
async fn requests_carry_credentials_and_log_context() {
    let backend = backend();
    backend.set_console_log(vec!["handler ran".into()]);
    let config = RuntimeConfig::new(
        service(),
        "mem://chat",
        Credentials::admin("admin key").with_bearer_token("tok"),
    )
    .with_log_context_prefix("it");
    let client = client_with_config(&backend, config);

    client.get_data(&user_key(&client, "u1")).await.unwrap();

    let params = backend.connect_params();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].authorization_key().as_deref(), Some("admin key"));
    assert_eq!(params[0].subprotocol.as_deref(), Some("tok"));
    let request = &backend.requests()[0];
    assert!(request.log_context.starts_with("it-"));
    assert_eq!(request.service_id, SERVICE_ID);
    assert_eq!(request.service_version, SERVICE_VERSION);
}

#[tokio::test]
async fn sessions_are_passed_by_reference() {
    let backend = backend();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    backend.on_method(4, move |call| {
        sink.lock().push(call.target.clone());
        MethodOutcome::value(call.target.clone())
    });
    let client = client_for(&backend);
    let session = client.session("ChatSession", "s-42").unwrap();

    let value = client.call_method(&session, 4, Vec::new()).await.unwrap();
    let Value::Session(echoed) = value else {
        panic!("expected a session");
    };
    assert_eq!(echoed.key(), session.key());
    assert!(client.state().identity().is_empty());
    assert_eq!(received.lock().len(), 1);
}
