//! UDP listener end-to-end tests
//!
//! A real server is started on an ephemeral port and driven with RADIUS
//! datagrams from a client socket.

mod common;

use common::*;
use radius_aaa::{
    Config, Filter, ListenerConfig, Module, ModuleDescriptor, Server, ServerError, SessionError,
    StaticLoader,
};
use radius_proto::{
    AcctStatusType, Attribute, AttributeType, Code, Packet, generate_request_authenticator,
    verify_response_authenticator,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::{Duration, sleep};

fn udp_listener(name: &str, modules: &[&str]) -> ListenerConfig {
    modules.iter().fold(
        ListenerConfig::new(name, "udp")
            .with_extra("Port", 0)
            .with_extra("Address", "127.0.0.1"),
        |listener, module| listener.with_module(ModuleDescriptor::new(*module)),
    )
}

fn config(listeners: Vec<ListenerConfig>) -> Config {
    Config {
        listeners,
        ..Default::default()
    }
}

fn access_request(identifier: u8) -> Packet {
    let mut packet = Packet::new(
        Code::AccessRequest,
        identifier,
        generate_request_authenticator(),
    );
    packet.add_attribute(Attribute::string(AttributeType::UserName.as_u8(), "alice").unwrap());
    packet.add_attribute(
        Attribute::string(AttributeType::CallingStationId.as_u8(), "aa-bb-cc-dd-ee-ff").unwrap(),
    );
    packet.add_attribute(
        Attribute::string(AttributeType::CalledStationId.as_u8(), "ap-1:wifi").unwrap(),
    );
    packet
}

async fn start(config: Config, loader: &StaticLoader) -> Arc<Server> {
    let server = Arc::new(Server::new(config, loader).unwrap());
    assert!(server.start_and_wait().await);
    server
}

#[tokio::test]
async fn test_chain_reply_reaches_client() {
    let calls = Calls::new();
    let loader = loader_with_module("first", &calls, Some(accept_with_reply_message("hello")))
        .register_module("second", {
            let calls = Arc::clone(&calls);
            move || -> Box<dyn Module> { Box::new(MockModule::new(&calls, None)) }
        })
        .register_module("third", {
            let calls = Arc::clone(&calls);
            move || -> Box<dyn Module> { Box::new(MockModule::new(&calls, None)) }
        });

    let server = start(
        config(vec![udp_listener("auth", &["first", "second", "third"])]),
        &loader,
    )
    .await;
    let addr = server.local_addr("auth").unwrap();
    assert_eq!(calls.initialized(), 3);

    let client = client_socket().await;
    let request = access_request(7);
    let reply = exchange(&client, addr, &request).await.expect("no reply");

    assert_eq!(reply.code, Code::AccessAccept);
    assert_eq!(reply.identifier, 7);
    assert_eq!(
        reply.string_attribute(AttributeType::ReplyMessage),
        Some("hello".to_string())
    );
    assert!(verify_response_authenticator(
        &reply,
        &request.authenticator,
        SECRET
    ));
    assert_eq!(calls.handled(), 3);

    let counters = server.counters();
    for module in ["first", "second", "third"] {
        let module_counters = counters.module("auth", module);
        assert_eq!(module_counters.succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(module_counters.failed.load(Ordering::Relaxed), 0);
    }
    assert_eq!(
        counters.listener("auth").replies.load(Ordering::Relaxed),
        1
    );

    server.stop().await;
}

#[tokio::test]
async fn test_loopback_echoes_attributes() {
    let server = start(
        config(vec![udp_listener("auth", &["testloopback"])]),
        &StaticLoader::with_builtins(),
    )
    .await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    let reply = exchange(&client, addr, &access_request(1))
        .await
        .expect("no reply");

    assert_eq!(reply.code, Code::AccessAccept);
    assert_eq!(
        reply.string_attribute(AttributeType::UserName),
        Some("alice".to_string())
    );

    server.stop().await;
}

#[tokio::test]
async fn test_module_init_failure_aborts_construction() {
    let calls = Calls::new();
    let loader = loader_with_module("mock", &calls, None);

    let mut descriptor = ModuleDescriptor::new("mock");
    descriptor.config.insert("fail_init".to_string(), json!(true));
    let listener = udp_listener("auth", &[]).with_module(descriptor);

    let result = Server::new(config(vec![listener]), &loader);
    assert!(matches!(result, Err(ServerError::ModuleInit { name, .. }) if name == "mock"));
    assert_eq!(calls.initialized(), 1);
}

#[tokio::test]
async fn test_filter_init_failure_aborts_construction() {
    let calls = Calls::new();
    let loader = StaticLoader::with_builtins().register_filter("broken", {
        let calls = Arc::clone(&calls);
        move || -> Box<dyn Filter> { Box::new(MockFilter::new(&calls, true, false)) }
    });

    let config = Config {
        filters: vec!["broken".to_string()],
        ..config(vec![udp_listener("auth", &["testloopback"])])
    };
    let result = Server::new(config, &loader);
    assert!(matches!(result, Err(ServerError::FilterInit { name, .. }) if name == "broken"));
}

#[tokio::test]
async fn test_filter_rejection_skips_modules() {
    let module_calls = Calls::new();
    let filter_calls = Calls::new();
    let loader = loader_with_module("mock", &module_calls, Some(accept_with_reply_message("x")))
        .register_filter("reject", {
            let calls = Arc::clone(&filter_calls);
            move || -> Box<dyn Filter> { Box::new(MockFilter::new(&calls, false, true)) }
        });

    let config = Config {
        filters: vec!["reject".to_string()],
        ..config(vec![udp_listener("auth", &["mock"])])
    };
    let server = start(config, &loader).await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    assert!(exchange(&client, addr, &access_request(3)).await.is_none());

    assert_eq!(filter_calls.handled(), 1);
    assert_eq!(module_calls.handled(), 0);
    assert_eq!(
        server
            .counters()
            .listener("auth")
            .filtered
            .load(Ordering::Relaxed),
        1
    );

    server.stop().await;
}

#[tokio::test]
async fn test_client_allowlist_rejects_unknown_client() {
    let mut config = config(vec![udp_listener("auth", &["testloopback"])]);
    config.filters = vec!["client_allowlist".to_string()];
    config.clients = vec![radius_aaa::Client {
        address: "10.0.0.0/8".to_string(),
        secret: None,
        name: None,
        enabled: true,
    }];
    let server = start(config, &StaticLoader::with_builtins()).await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    assert!(exchange(&client, addr, &access_request(4)).await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_reply_signed_with_client_secret() {
    let mut config = config(vec![udp_listener("auth", &["testloopback"])]);
    config.clients = vec![radius_aaa::Client {
        address: "127.0.0.0/8".to_string(),
        secret: Some("loopback-secret".to_string()),
        name: None,
        enabled: true,
    }];
    let server = start(config, &StaticLoader::with_builtins()).await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    let request = access_request(11);
    let reply = exchange(&client, addr, &request).await.expect("no reply");

    assert!(verify_response_authenticator(
        &reply,
        &request.authenticator,
        b"loopback-secret"
    ));
    assert!(!verify_response_authenticator(
        &reply,
        &request.authenticator,
        SECRET
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_retransmissions_are_dropped() {
    let calls = Calls::new();
    let loader = loader_with_module("silent", &calls, None);
    let config = Config {
        dedup_window_ms: 100,
        ..config(vec![udp_listener("auth", &["silent"])])
    };
    let server = start(config, &loader).await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    let encoded = access_request(9).encode().unwrap();
    for _ in 0..9 {
        client.send_to(&encoded, addr).await.unwrap();
    }
    sleep(Duration::from_millis(50)).await;

    assert!(
        server.dropped_count() > 5,
        "dropped {}",
        server.dropped_count()
    );
    assert!(calls.handled() >= 1);

    server.stop().await;
}

#[tokio::test]
async fn test_new_identifier_is_not_a_duplicate() {
    let server = start(
        config(vec![udp_listener("auth", &["testloopback"])]),
        &StaticLoader::with_builtins(),
    )
    .await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    assert!(exchange(&client, addr, &access_request(20)).await.is_some());
    assert!(exchange(&client, addr, &access_request(21)).await.is_some());
    assert_eq!(server.dropped_count(), 0);

    server.stop().await;
}

fn accounting_request(identifier: u8, acct_session_id: &str, status: AcctStatusType) -> Packet {
    let mut packet = Packet::new(Code::AccountingRequest, identifier, [0u8; 16]);
    packet.add_attribute(
        Attribute::integer(AttributeType::AcctStatusType.as_u8(), status.as_u32()).unwrap(),
    );
    packet.add_attribute(
        Attribute::string(AttributeType::AcctSessionId.as_u8(), acct_session_id).unwrap(),
    );
    packet.add_attribute(
        Attribute::string(AttributeType::CallingStationId.as_u8(), "aa-bb-cc-dd-ee-ff").unwrap(),
    );
    packet
}

async fn start_tracking() -> Arc<Server> {
    start(
        config(vec![
            udp_listener("auth", &["sessiontracker", "testloopback"]),
            udp_listener("acct", &["sessiontracker", "testloopback"]),
        ]),
        &StaticLoader::with_builtins(),
    )
    .await
}

#[tokio::test]
async fn test_accounting_without_session_is_answered() {
    let server = start_tracking().await;
    let acct = server.local_addr("acct").unwrap();

    let client = client_socket().await;
    let reply = exchange(
        &client,
        acct,
        &accounting_request(5, "unknown-session", AcctStatusType::Start),
    )
    .await
    .expect("no accounting reply");

    assert_eq!(reply.code, Code::AccountingResponse);
    assert_eq!(
        AcctStatusType::from_packet(&reply),
        Some(AcctStatusType::Start)
    );
    assert!(matches!(
        server.session_state("unknown-session").await,
        Err(SessionError::NotFound(_))
    ));

    let counters = server.counters().module("acct", "sessiontracker");
    assert_eq!(counters.succeeded.load(Ordering::Relaxed), 1);
    assert_eq!(counters.failed.load(Ordering::Relaxed), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_accounting_after_authorization() {
    let server = start_tracking().await;
    let auth = server.local_addr("auth").unwrap();
    let acct = server.local_addr("acct").unwrap();

    let client = client_socket().await;
    let mut access = access_request(1);
    access.add_attribute(
        Attribute::string(AttributeType::AcctSessionId.as_u8(), "session-0001").unwrap(),
    );
    assert!(exchange(&client, auth, &access).await.is_some());
    let correlation_id = server
        .session_state("session-0001")
        .await
        .unwrap()
        .correlation_id;
    assert_ne!(correlation_id, 0);

    let statuses = [
        AcctStatusType::Start,
        AcctStatusType::InterimUpdate,
        AcctStatusType::Stop,
    ];
    for (identifier, status) in (2u8..).zip(statuses) {
        let reply = exchange(
            &client,
            acct,
            &accounting_request(identifier, "session-0001", status),
        )
        .await
        .expect("no accounting reply");
        assert_eq!(reply.code, Code::AccountingResponse);
        assert_eq!(AcctStatusType::from_packet(&reply), Some(status));

        let state = server.session_state("session-0001").await.unwrap();
        assert_eq!(state.correlation_id, correlation_id);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_interim_and_stop_without_session() {
    let server = start_tracking().await;
    let acct = server.local_addr("acct").unwrap();

    let client = client_socket().await;
    for (identifier, status) in [(30, AcctStatusType::InterimUpdate), (31, AcctStatusType::Stop)] {
        let reply = exchange(
            &client,
            acct,
            &accounting_request(identifier, "never-authorized", status),
        )
        .await
        .expect("no accounting reply");
        assert_eq!(reply.code, Code::AccountingResponse);
        assert_eq!(AcctStatusType::from_packet(&reply), Some(status));
    }

    assert!(matches!(
        server.session_state("never-authorized").await,
        Err(SessionError::NotFound(_))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_datagram_is_ignored() {
    let server = start(
        config(vec![udp_listener("auth", &["testloopback"])]),
        &StaticLoader::with_builtins(),
    )
    .await;
    let addr = server.local_addr("auth").unwrap();

    let client = client_socket().await;
    client.send_to(&[1, 2, 3], addr).await.unwrap();
    assert!(receive(&client, Duration::from_millis(200)).await.is_none());

    // Still serving
    assert!(exchange(&client, addr, &access_request(2)).await.is_some());

    server.stop().await;
}
