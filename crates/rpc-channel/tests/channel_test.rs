//! End-to-end tests against a loopback server.

mod common;

use common::{TestServer, eventually, init_tracing};
use proven_rpc_channel::protocol::{REGISTER_METHOD_NAME, REGISTER_SERVICE_NAME};
use proven_rpc_channel::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn options(protocol: StandardProtocol) -> CommunicationOptions {
    CommunicationOptions::builder().protocol(protocol).build()
}

#[tokio::test]
async fn test_call_round_trip() {
    init_tracing();
    let mut server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let instance = server.instance("user-service");

    let call = {
        let dispatcher = dispatcher.clone();
        let instance = instance.clone();
        tokio::spawn(async move {
            dispatcher
                .call(&instance, "UserService", "getName", vec![json!(42)])
                .await
        })
    };

    let mut conn = server.accept().await;
    let request = conn.recv_request().await;
    assert_eq!(request.service_name, "UserService");
    assert_eq!(request.method_name, "getName");
    assert_eq!(request.args, vec![json!(42)]);
    assert_eq!(request.push_header, None);
    conn.respond(RpcResponse::success(request.correlation_id, json!("alice")))
        .await;

    assert_eq!(call.await.unwrap().unwrap(), json!("alice"));

    let pooled = dispatcher.registry().connections(&instance);
    assert_eq!(pooled.len(), 1);
    let window = pooled[0].latency_window();
    assert_eq!(window.len(), 1);
    assert!(!window[0].is_timeout());
    assert_eq!(pooled[0].failed_num(), 0);
    assert!(dispatcher.store().is_empty());
}

#[tokio::test]
async fn test_out_of_order_responses() {
    init_tracing();
    let mut server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let client = dispatcher.acquire(&server.instance("svc")).await.unwrap();
    let mut conn = server.accept().await;

    let first = dispatcher
        .start(&client, RpcRequest::new("Svc", "a", vec![]))
        .await
        .unwrap();
    let second = dispatcher
        .start(&client, RpcRequest::new("Svc", "b", vec![]))
        .await
        .unwrap();
    assert_ne!(first.correlation_id(), second.correlation_id());
    assert_eq!(client.in_flight(), 2);

    let a = conn.recv_request().await;
    let b = conn.recv_request().await;
    conn.respond(RpcResponse::success(b.correlation_id, json!("b")))
        .await;
    conn.respond(RpcResponse::success(a.correlation_id, json!("a")))
        .await;

    assert_eq!(second.wait().await.unwrap().result, Some(json!("b")));
    assert_eq!(first.wait().await.unwrap().result, Some(json!("a")));
}

#[tokio::test]
async fn test_timeout_then_late_response_is_dropped() {
    init_tracing();
    let mut server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let client = dispatcher.acquire(&server.instance("svc")).await.unwrap();
    let mut conn = server.accept().await;

    let timeout = Duration::from_millis(200);
    let err = dispatcher
        .invoke(&client, RpcRequest::new("Svc", "slow", vec![]), Some(timeout))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(t) if t == timeout));
    assert_eq!(client.failed_num(), 1);
    assert_eq!(
        client.latency_window().last(),
        Some(&LatencySample::ReadTimeout(timeout))
    );

    let slow = conn.recv_request().await;
    assert!(
        !dispatcher
            .store()
            .resolve(slow.correlation_id, Err(Error::ConnectionClosed))
    );
    conn.respond(RpcResponse::success(slow.correlation_id, json!("late")))
        .await;

    // The late answer is ignored and the connection keeps working.
    let next = {
        let dispatcher = dispatcher.clone();
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            dispatcher
                .invoke(&client, RpcRequest::new("Svc", "fast", vec![]), None)
                .await
        })
    };
    let fast = conn.recv_request().await;
    conn.respond(RpcResponse::success(fast.correlation_id, json!("ok")))
        .await;

    assert_eq!(next.await.unwrap().unwrap(), json!("ok"));
    assert!(client.is_connected());
    assert_eq!(client.failed_num(), 1);
}

#[tokio::test]
async fn test_remote_error_is_not_a_connection_failure() {
    init_tracing();
    let mut server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let client = dispatcher.acquire(&server.instance("svc")).await.unwrap();
    let mut conn = server.accept().await;

    let call = {
        let dispatcher = dispatcher.clone();
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            dispatcher
                .invoke(&client, RpcRequest::new("Svc", "missing", vec![]), None)
                .await
        })
    };
    let request = conn.recv_request().await;
    conn.respond(RpcResponse::failure(
        request.correlation_id,
        ErrorInfo::new("NOT_FOUND", "no such method"),
    ))
    .await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Handler(HandlerError::Remote { ref code, .. }) if code == "NOT_FOUND"
    ));
    assert_eq!(client.failed_num(), 0);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_close_fails_pending_invocations() {
    init_tracing();
    let server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let client = dispatcher.acquire(&server.instance("svc")).await.unwrap();

    let pending = dispatcher
        .start(&client, RpcRequest::new("Svc", "wait", vec![]))
        .await
        .unwrap();
    let id = pending.correlation_id();

    client.close().await;

    assert!(pending.wait().await.unwrap_err().is_connection_closed());
    assert!(!dispatcher.store().contains(id));
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = client.send(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::NotConnected(ConnectionState::Closed))
    ));
}

#[tokio::test]
async fn test_peer_disconnect_fails_pending_and_evicts() {
    init_tracing();
    let mut server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let instance = server.instance("svc");
    let client = dispatcher.acquire(&instance).await.unwrap();
    let mut conn = server.accept().await;

    let pending = dispatcher
        .start(&client, RpcRequest::new("Svc", "wait", vec![]))
        .await
        .unwrap();
    conn.recv_request().await;
    drop(conn);

    assert!(pending.wait().await.unwrap_err().is_connection_closed());
    eventually(|| client.state() == ConnectionState::Failed).await;

    let replacement = dispatcher.acquire(&instance).await.unwrap();
    assert_ne!(replacement.id(), client.id());
    assert_eq!(*replacement, *client);
    assert_eq!(dispatcher.registry().connections(&instance).len(), 1);
    server.accept().await;
}

#[tokio::test]
async fn test_pool_reuses_idle_connection() {
    init_tracing();
    let server = TestServer::start(StandardProtocol::new()).await;
    let dispatcher = InvocationDispatcher::new(options(StandardProtocol::new()));
    let instance = server.instance("svc");

    let a = dispatcher.acquire(&instance).await.unwrap();
    let b = dispatcher.acquire(&instance).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let factory = dispatcher
        .registry()
        .get_or_create_factory("svc", dispatcher.options());
    assert_eq!(factory.connections_opened(), 1);

    assert!(dispatcher.registry().remove(&a));
    assert!(!dispatcher.registry().remove(&a));
    assert!(a.is_connected());

    dispatcher.registry().close_all().await;
    assert!(dispatcher.registry().connections(&instance).is_empty());
}

#[tokio::test]
async fn test_push_registration_and_dispatch() {
    init_tracing();
    let handlers = Arc::new(PushHandlers::new());
    handlers.register_fn("UserPushApi", "clientReceive", |request| async move {
        let data = request.args[0]["data"].as_str().unwrap_or_default().to_string();
        Ok(json!({"result": format!("got data:{data}")}))
    });
    let options = CommunicationOptions::builder()
        .protocol(StandardProtocol::with_push())
        .client_name("clientA")
        .push_handlers(handlers)
        .build();

    let mut server = TestServer::start(StandardProtocol::with_push()).await;
    let dispatcher = InvocationDispatcher::new(options);
    let client = dispatcher.acquire(&server.instance("svc")).await.unwrap();
    let mut conn = server.accept().await;

    // Registration is the first frame on the wire.
    let registration = match conn.recv().await {
        Packet::Push(PushFrame::Request(request)) => request,
        other => panic!("expected registration, got {other:?}"),
    };
    assert_eq!(
        registration.push_header.map(|h| h.push_type),
        Some(PushType::RegisterRequest)
    );
    assert_eq!(registration.service_name, REGISTER_SERVICE_NAME);
    assert_eq!(registration.method_name, REGISTER_METHOD_NAME);
    assert_eq!(registration.args, vec![json!("clientA")]);
    assert!(!client.push_registered());

    conn.respond(
        RpcResponse::success(registration.correlation_id, json!(true))
            .with_push_header(PushHeader::new(PushType::RegisterResponse)),
    )
    .await;
    eventually(|| client.push_registered()).await;

    let mut push = RpcRequest::new("UserPushApi", "clientReceive", vec![json!({"data": "hello"})])
        .with_push_header(PushHeader::new(PushType::PushRequest));
    push.correlation_id = 7;
    conn.send_request(push).await;

    match conn.recv().await {
        Packet::Push(PushFrame::Response(response)) => {
            assert_eq!(response.correlation_id, 7);
            assert_eq!(
                response.push_header.map(|h| h.push_type),
                Some(PushType::PushResponse)
            );
            assert_eq!(response.result, Some(json!({"result": "got data:hello"})));
        }
        other => panic!("expected push response, got {other:?}"),
    }

    // Ordinary calls still work on a push connection.
    let call = {
        let dispatcher = dispatcher.clone();
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            dispatcher
                .invoke(&client, RpcRequest::new("UserService", "ping", vec![]), None)
                .await
        })
    };
    let request = conn.recv_request().await;
    assert_eq!(
        request.push_header.map(|h| h.push_type),
        Some(PushType::Request)
    );
    conn.respond(RpcResponse::success(request.correlation_id, json!("pong")))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_pending_registration_does_not_grow_pool() {
    init_tracing();
    let options = CommunicationOptions::builder()
        .protocol(StandardProtocol::with_push())
        .client_name("clientA")
        .build();

    let mut server = TestServer::start(StandardProtocol::with_push()).await;
    let dispatcher = InvocationDispatcher::new(options);
    let instance = server.instance("svc");

    let first = dispatcher.acquire(&instance).await.unwrap();
    let mut conn = server.accept().await;
    conn.recv().await;
    assert!(!first.push_registered());
    assert_eq!(first.in_flight(), 0);
    assert_eq!(dispatcher.store().len(), 1);

    let second = dispatcher.acquire(&instance).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(dispatcher.registry().connections(&instance).len(), 1);

    // Closing still fails the unanswered registration.
    first.close().await;
    assert!(dispatcher.store().is_empty());
}

#[tokio::test]
async fn test_shared_registry_keeps_protocols_apart() {
    init_tracing();
    let mut server = TestServer::start(StandardProtocol::with_push()).await;
    let instance = server.instance("svc");
    let registry = Arc::new(ConnectionPoolRegistry::new(Arc::new(CorrelationStore::new())));

    let plain = InvocationDispatcher::with_registry(
        Arc::new(options(StandardProtocol::new())),
        Arc::clone(&registry),
    );
    let push = InvocationDispatcher::with_registry(
        Arc::new(
            CommunicationOptions::builder()
                .protocol(StandardProtocol::with_push())
                .client_name("clientA")
                .build(),
        ),
        Arc::clone(&registry),
    );

    let plain_conn = plain.acquire(&instance).await.unwrap();
    let _plain_server = server.accept().await;
    let push_conn = push.acquire(&instance).await.unwrap();
    let mut push_server = server.accept().await;

    assert!(!plain_conn.protocol().supports_push());
    assert!(push_conn.protocol().supports_push());
    assert_ne!(plain_conn.id(), push_conn.id());

    match push_server.recv().await {
        Packet::Push(PushFrame::Request(request)) => {
            assert_eq!(
                request.push_header.map(|h| h.push_type),
                Some(PushType::RegisterRequest)
            );
            assert_eq!(request.args, vec![json!("clientA")]);
        }
        other => panic!("expected registration, got {other:?}"),
    }

    assert!(Arc::ptr_eq(&plain.acquire(&instance).await.unwrap(), &plain_conn));
    assert!(Arc::ptr_eq(&push.acquire(&instance).await.unwrap(), &push_conn));
    assert_eq!(registry.connections(&instance).len(), 2);
    assert_eq!(registry.pool_count(), 2);
}

#[tokio::test]
async fn test_push_without_handler_answers_not_found() {
    init_tracing();
    let options = CommunicationOptions::builder()
        .protocol(StandardProtocol::with_push())
        .client_name("clientB")
        .build();

    let mut server = TestServer::start(StandardProtocol::with_push()).await;
    let dispatcher = InvocationDispatcher::new(options);
    let _client = dispatcher.acquire(&server.instance("svc")).await.unwrap();
    let mut conn = server.accept().await;
    conn.recv().await;

    let mut push = RpcRequest::new("UserPushApi", "unknown", vec![])
        .with_push_header(PushHeader::new(PushType::PushRequest));
    push.correlation_id = 11;
    conn.send_request(push).await;

    match conn.recv().await {
        Packet::Push(PushFrame::Response(response)) => {
            assert_eq!(response.correlation_id, 11);
            assert_eq!(response.error.map(|e| e.code), Some("NOT_FOUND".to_string()));
        }
        other => panic!("expected push response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_await_confirmation_blocks_connect() {
    init_tracing();
    let options = CommunicationOptions::builder()
        .protocol(StandardProtocol::with_push())
        .client_name("clientA")
        .registration_mode(RegistrationMode::AwaitConfirmation)
        .build();

    let mut server = TestServer::start(StandardProtocol::with_push()).await;
    let dispatcher = InvocationDispatcher::new(options);
    let instance = server.instance("svc");

    let acquire = {
        let dispatcher = dispatcher.clone();
        let instance = instance.clone();
        tokio::spawn(async move { dispatcher.acquire(&instance).await })
    };

    let mut conn = server.accept().await;
    let registration = match conn.recv().await {
        Packet::Push(PushFrame::Request(request)) => request,
        other => panic!("expected registration, got {other:?}"),
    };
    assert!(!acquire.is_finished());

    conn.respond(
        RpcResponse::success(registration.correlation_id, json!(true))
            .with_push_header(PushHeader::new(PushType::RegisterResponse)),
    )
    .await;

    let client = acquire.await.unwrap().unwrap();
    assert!(client.push_registered());
}

#[tokio::test]
async fn test_rejected_registration_is_not_pooled() {
    init_tracing();
    let options = CommunicationOptions::builder()
        .protocol(StandardProtocol::with_push())
        .client_name("intruder")
        .registration_mode(RegistrationMode::AwaitConfirmation)
        .build();

    let mut server = TestServer::start(StandardProtocol::with_push()).await;
    let dispatcher = InvocationDispatcher::new(options);
    let instance = server.instance("svc");

    let acquire = {
        let dispatcher = dispatcher.clone();
        let instance = instance.clone();
        tokio::spawn(async move { dispatcher.acquire(&instance).await })
    };

    let mut conn = server.accept().await;
    let registration = match conn.recv().await {
        Packet::Push(PushFrame::Request(request)) => request,
        other => panic!("expected registration, got {other:?}"),
    };
    conn.respond(
        RpcResponse::failure(
            registration.correlation_id,
            ErrorInfo::new("UNAUTHORIZED", "unknown client"),
        )
        .with_push_header(PushHeader::new(PushType::RegisterResponse)),
    )
    .await;

    let err = acquire.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::RegistrationFailed(_))
    ));
    assert!(dispatcher.registry().connections(&instance).is_empty());
    assert!(dispatcher.store().is_empty());
}
