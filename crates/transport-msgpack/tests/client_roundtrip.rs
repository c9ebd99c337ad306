use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use transport_msgpack::codec::{decode_next, encode};
use transport_msgpack::{Client, Message, RpcError, Value};

/// Reads frames from the peer side of a duplex pipe until one is complete.
async fn next_frame(stream: &mut DuplexStream, buf: &mut BytesMut) -> Option<Message> {
    loop {
        if let Some(message) = decode_next(buf).expect("decode") {
            return Some(message);
        }
        let read = stream.read_buf(buf).await.expect("peer read");
        if read == 0 {
            return None;
        }
    }
}

async fn reply(stream: &mut DuplexStream, message: Message) {
    let bytes = encode(message).expect("encode");
    stream.write_all(&bytes).await.expect("peer write");
}

#[test_timeout::tokio_timeout_test(10)]
async fn call_returns_peer_result() {
    let (local, mut peer) = tokio::io::duplex(4096);
    let client = Client::from_stream(local);

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let Some(Message::Request { id, method, params }) = next_frame(&mut peer, &mut buf).await
        else {
            panic!("expected request");
        };
        assert_eq!(method, "nvim_win_get_cursor");
        assert_eq!(params, vec![Value::from(1000)]);
        reply(
            &mut peer,
            Message::Response {
                id,
                error: Value::Nil,
                result: Value::Array(vec![Value::from(3), Value::from(0)]),
            },
        )
        .await;
        peer
    });

    let result = client
        .call("nvim_win_get_cursor", vec![Value::from(1000)])
        .await
        .expect("call ok");
    assert_eq!(result, Value::Array(vec![Value::from(3), Value::from(0)]));
    let _peer = server.await.expect("server task");
}

#[test_timeout::tokio_timeout_test(10)]
async fn out_of_order_responses_reach_their_callers() {
    let (local, mut peer) = tokio::io::duplex(4096);
    let client = std::sync::Arc::new(Client::from_stream(local));

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let mut requests = Vec::new();
        while requests.len() < 2 {
            match next_frame(&mut peer, &mut buf).await {
                Some(Message::Request { id, method, .. }) => requests.push((id, method)),
                Some(other) => panic!("unexpected frame {other:?}"),
                None => panic!("client hung up"),
            }
        }
        for (id, method) in requests.into_iter().rev() {
            reply(
                &mut peer,
                Message::Response {
                    id,
                    error: Value::Nil,
                    result: Value::from(method),
                },
            )
            .await;
        }
        peer
    });

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.call("first", Vec::new()).await })
    };
    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.call("second", Vec::new()).await })
    };

    assert_eq!(first.await.unwrap().unwrap().as_str(), Some("first"));
    assert_eq!(second.await.unwrap().unwrap().as_str(), Some("second"));
    let _peer = server.await.expect("server task");
}

#[test_timeout::tokio_timeout_test(10)]
async fn remote_error_is_surfaced() {
    let (local, mut peer) = tokio::io::duplex(4096);
    let client = Client::from_stream(local);

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        // Notifications from the editor must not disturb pending calls.
        reply(
            &mut peer,
            Message::Notification {
                method: "nvim_buf_lines_event".into(),
                params: Vec::new(),
            },
        )
        .await;
        let Some(Message::Request { id, .. }) = next_frame(&mut peer, &mut buf).await else {
            panic!("expected request");
        };
        reply(
            &mut peer,
            Message::Response {
                id,
                error: Value::Array(vec![Value::from(1), Value::from("Invalid window id: 9")]),
                result: Value::Nil,
            },
        )
        .await;
        peer
    });

    let err = client
        .call("nvim_win_get_buf", vec![Value::from(9)])
        .await
        .expect_err("remote error");
    match err {
        RpcError::Remote { message } => assert_eq!(message, "Invalid window id: 9"),
        other => panic!("unexpected error {other:?}"),
    }
    let _peer = server.await.expect("server task");
}

#[test_timeout::tokio_timeout_test(10)]
async fn pending_calls_fail_when_peer_hangs_up() {
    let (local, mut peer) = tokio::io::duplex(4096);
    let client = Client::from_stream(local);

    let server = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        let _ = next_frame(&mut peer, &mut buf).await;
        drop(peer);
    });

    let err = client
        .call("nvim_buf_set_lines", Vec::new())
        .await
        .expect_err("closed");
    assert!(matches!(err, RpcError::Closed));
    server.await.expect("server task");

    assert!(client.is_closed());
    assert!(matches!(
        client.call("nvim_command", Vec::new()).await,
        Err(RpcError::Closed)
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn inbound_requests_are_rejected() {
    let (local, mut peer) = tokio::io::duplex(4096);
    let _client = Client::from_stream(local);

    reply(
        &mut peer,
        Message::Request {
            id: 42,
            method: "vim_get_clipboard".into(),
            params: Vec::new(),
        },
    )
    .await;

    let mut buf = BytesMut::new();
    match next_frame(&mut peer, &mut buf).await {
        Some(Message::Response { id, error, result }) => {
            assert_eq!(id, 42);
            assert!(!error.is_nil());
            assert!(result.is_nil());
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn notifications_reach_peer_without_reply() {
    let (local, mut peer) = tokio::io::duplex(4096);
    let client = Client::from_stream(local);

    client
        .notify("nvim_command", vec![Value::from("echo 'Loading...'")])
        .expect("notify");

    let mut buf = BytesMut::new();
    match next_frame(&mut peer, &mut buf).await {
        Some(Message::Notification { method, params }) => {
            assert_eq!(method, "nvim_command");
            assert_eq!(params, vec![Value::from("echo 'Loading...'")]);
        }
        other => panic!("expected notification, got {other:?}"),
    }

    // No pending call was registered, so a later call still gets id-matched.
    let server = tokio::spawn(async move {
        let Some(Message::Request { id, .. }) = next_frame(&mut peer, &mut buf).await else {
            panic!("expected request");
        };
        reply(
            &mut peer,
            Message::Response {
                id,
                error: Value::Nil,
                result: Value::from(7),
            },
        )
        .await;
        peer
    });
    let result = client.call("nvim_get_current_buf", Vec::new()).await.expect("call ok");
    assert_eq!(result.as_i64(), Some(7));
    let _peer = server.await.expect("server task");
}
