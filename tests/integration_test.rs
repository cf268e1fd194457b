//! Integration tests driving the client engine against an in-process peer.

use std::time::Duration;

use kvdirect::session::SessionConfig;
use kvdirect::{
    DbServer, Endpoint, Error, Fabric, FabricEvent, KvClient, Listener, LoopbackFabric, Message,
    ServerConfig, Session, SessionState, MESSAGE_SIZE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kvdirect=debug")
        .try_init();
}

fn test_config() -> SessionConfig {
    SessionConfig {
        addr: "127.0.0.1".to_string(),
        port: 21212,
        // bound every wait so an engine bug fails the test instead of
        // hanging it
        poll_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    }
}

fn spawn_server(fabric: &LoopbackFabric) {
    let server = DbServer::bind(
        fabric,
        ServerConfig {
            addr: "127.0.0.1".to_string(),
            port: 21212,
            entries: 64,
            queue_depth: 1,
        },
    )
    .unwrap();
    tokio::spawn(server.run());
}

/// Accept one connection on `listener`, arm a single receive slot, and hand
/// the established endpoint to the script.
async fn accept_scripted(listener: Box<dyn Listener>) -> Box<dyn Endpoint> {
    let endpoint = loop {
        match listener.try_accept() {
            Some(endpoint) => break endpoint,
            None => tokio::task::yield_now().await,
        }
    };
    let region = endpoint.register_region(MESSAGE_SIZE, false).unwrap();
    endpoint.post_recv(0, &region, 0, MESSAGE_SIZE).unwrap();
    while !endpoint.poll_connect().unwrap() {
        tokio::task::yield_now().await;
    }
    endpoint
}

async fn wait_recv(endpoint: &dyn Endpoint) {
    loop {
        if endpoint.poll_recv().is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_set_roundtrip() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    assert_eq!(client.state(), SessionState::Ready);

    let (key, value) = client.set(42, 7).await.unwrap();
    assert_eq!((key, value), (42, 7));

    let (key, value) = client.query(42).await.unwrap();
    assert_eq!((key, value), (42, 7));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_query_of_never_set_key_returns_zero() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    let (key, value) = client.query(42).await.unwrap();
    assert_eq!((key, value), (42, 0));
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_one_sided_write_lands_where_set_would() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    client.write_direct(5, 99).await.unwrap();

    let (key, value) = client.query(5).await.unwrap();
    assert_eq!((key, value), (5, 99));
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_write_target_address_arithmetic() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    let db = client.remote_db().unwrap();

    client.write_direct(5, 99).await.unwrap();
    client.write_direct(6, 1).await.unwrap();

    let writes: Vec<_> = fabric
        .events()
        .into_iter()
        .filter_map(|e| match e {
            FabricEvent::WriteIssued {
                remote_addr,
                rkey,
                len,
            } => Some((remote_addr, rkey, len)),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, db.base_addr + 5 * 4);
    assert_eq!(writes[1].0 - writes[0].0, 4);
    assert_eq!(writes[0].1, db.rkey);
    assert_eq!(writes[0].2, 4);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_without_prior_operations() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let session = Session::connect(&fabric, &test_config()).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    KvClient::new(session).disconnect().await.unwrap();
}

#[tokio::test]
async fn test_send_failure_leaves_session_usable() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();

    fabric.fail_next_send();
    let err = client.set(1, 2).await.unwrap_err();
    assert!(matches!(err, Error::Send(_)), "got {err:?}");

    let (key, value) = client.set(1, 2).await.unwrap();
    assert_eq!((key, value), (1, 2));
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_write_before_info_exchange_is_rejected() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let session = Session::connect(&fabric, &test_config()).await.unwrap();
    let mut client = KvClient::new(session);
    assert_eq!(client.state(), SessionState::Connected);

    let err = client.write_direct(5, 99).await.unwrap_err();
    assert!(matches!(err, Error::NotReady), "got {err:?}");

    // nothing was transmitted
    assert!(!fabric
        .events()
        .iter()
        .any(|e| matches!(e, FabricEvent::WriteIssued { .. })));

    client.handshake().await.unwrap();
    assert_eq!(client.state(), SessionState::Ready);
    client.write_direct(5, 99).await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_response_kind_fails_the_call() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    let listener = fabric.bind("127.0.0.1:21212".parse().unwrap()).unwrap();
    tokio::spawn(async move {
        let endpoint = accept_scripted(listener).await;
        wait_recv(endpoint.as_ref()).await;
        // answer the query with a set response
        let frame = Message::set_resp(1, 0).encode().unwrap();
        endpoint.post_send_inline(99, &frame).unwrap();
        // hold the endpoint open until the client is done with it
        std::future::pending::<()>().await;
    });

    let session = Session::connect(&fabric, &test_config()).await.unwrap();
    let mut client = KvClient::new(session);
    let err = client.query(1).await.unwrap_err();
    assert!(matches!(err, Error::Rpc(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unknown_response_kind_starves_the_slot() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    let listener = fabric.bind("127.0.0.1:21212".parse().unwrap()).unwrap();
    tokio::spawn(async move {
        let endpoint = accept_scripted(listener).await;
        let region = endpoint.register_region(MESSAGE_SIZE, false).unwrap();

        wait_recv(endpoint.as_ref()).await;
        endpoint.post_recv(0, &region, 0, MESSAGE_SIZE).unwrap();
        // answer with a frame carrying a tag no message kind uses
        let mut frame = Message::query_resp(1, 0).encode().unwrap();
        frame[0] = 0x63;
        endpoint.post_send_inline(99, &frame).unwrap();

        // the second request still arrives; the client just cannot hear the
        // answer anymore
        wait_recv(endpoint.as_ref()).await;
        let frame = Message::query_resp(1, 0).encode().unwrap();
        endpoint.post_send_inline(100, &frame).unwrap();
        std::future::pending::<()>().await;
    });

    let config = SessionConfig {
        poll_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let session = Session::connect(&fabric, &config).await.unwrap();
    let mut client = KvClient::new(session);

    let err = client.query(1).await.unwrap_err();
    assert!(matches!(err, Error::Rpc(_)), "got {err:?}");

    // the consumed slot was intentionally not reposted, so the next
    // response has nowhere to land
    let err = client.query(1).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    let listener = fabric.bind("127.0.0.1:21212".parse().unwrap()).unwrap();
    tokio::spawn(async move {
        let endpoint = accept_scripted(listener).await;
        wait_recv(endpoint.as_ref()).await;
        // never respond
        std::future::pending::<()>().await;
    });

    let config = SessionConfig {
        poll_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let session = Session::connect(&fabric, &config).await.unwrap();
    let mut client = KvClient::new(session);
    let err = client.query(1).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn test_partial_connect_failure_releases_in_reverse_order() {
    init_tracing();
    let fabric = LoopbackFabric::new();

    // the receive region registers first, the send region second; the
    // failure hits before the handshake, so no listener is needed
    fabric.fail_nth_registration(2);
    let err = Session::connect(&fabric, &test_config())
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, Error::Registration(_)), "got {err:?}");

    let events = fabric.events();
    let recv_lkey = events
        .iter()
        .find_map(|e| match e {
            FabricEvent::RegionRegistered { lkey } => Some(*lkey),
            _ => None,
        })
        .unwrap();
    let endpoint_id = events
        .iter()
        .find_map(|e| match e {
            FabricEvent::EndpointCreated { id } => Some(*id),
            _ => None,
        })
        .unwrap();
    // exactly the receive region and the endpoint are released, in that order
    assert_eq!(
        events,
        vec![
            FabricEvent::EndpointCreated { id: endpoint_id },
            FabricEvent::RegionRegistered { lkey: recv_lkey },
            FabricEvent::RegionDeregistered { lkey: recv_lkey },
            FabricEvent::EndpointDestroyed { id: endpoint_id },
        ]
    );
}

#[tokio::test]
async fn test_clean_disconnect_releases_in_reverse_order() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    let registered: Vec<_> = fabric
        .events()
        .iter()
        .filter_map(|e| match e {
            FabricEvent::RegionRegistered { lkey } => Some(*lkey),
            _ => None,
        })
        .collect();
    // client receive region, client send region, then the server's three
    let (recv_lkey, send_lkey) = (registered[0], registered[1]);

    client.disconnect().await.unwrap();

    let events = fabric.events();
    let dereg_send = events
        .iter()
        .position(|e| *e == FabricEvent::RegionDeregistered { lkey: send_lkey })
        .unwrap();
    let dereg_recv = events
        .iter()
        .position(|e| *e == FabricEvent::RegionDeregistered { lkey: recv_lkey })
        .unwrap();
    assert!(dereg_send < dereg_recv, "send region must release first");
}

#[tokio::test]
async fn test_inline_send_mode_end_to_end() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let config = SessionConfig {
        inline_send: true,
        ..test_config()
    };
    let mut client = KvClient::connect(&fabric, &config).await.unwrap();
    let (key, value) = client.set(3, 4).await.unwrap();
    assert_eq!((key, value), (3, 4));
    let (key, value) = client.query(3).await.unwrap();
    assert_eq!((key, value), (3, 4));
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_repeated_info_exchange_is_accepted() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    let first = client.remote_db().unwrap();

    client.handshake().await.unwrap();
    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(client.remote_db().unwrap(), first);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_slot_reuse_across_many_calls() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    spawn_server(&fabric);

    // queue depth 1: every call reuses the single receive slot, which only
    // works if each consumed completion reposts it
    let mut client = KvClient::connect(&fabric, &test_config()).await.unwrap();
    for i in 0..10 {
        client.set(i, i * 2).await.unwrap();
        let (_, value) = client.query(i).await.unwrap();
        assert_eq!(value, i * 2);
    }
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_connect_without_listener_fails() {
    init_tracing();
    let fabric = LoopbackFabric::new();
    let err = Session::connect(&fabric, &test_config())
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, Error::Connect(_)), "got {err:?}");
}
