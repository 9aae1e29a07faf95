use relay_proto::{read_frame, write_frame, ErrorCode, ErrorInfo, Message};
use tokio::net::{TcpListener, TcpStream};

async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (server, _) = listener.accept().await.unwrap();
    (server, connect.await.unwrap())
}

#[tokio::test]
async fn frame_roundtrips_a_message_over_a_real_socket() {
    let (mut server, mut client) = loopback_pair().await;

    let msg = Message::Request {
        ts: 1,
        id: "r1".into(),
        instance: None,
        command: "echo".into(),
        params: serde_json::json!({"x": 1}),
        timeout_ms: 30_000,
    };

    write_frame(&mut client, &msg).await.unwrap();
    let received: Message = read_frame(&mut server).await.unwrap();
    assert_eq!(received, msg);
}

#[tokio::test]
async fn error_frame_carries_code_and_message() {
    let (mut server, mut client) = loopback_pair().await;

    let msg = Message::error("r2", ErrorInfo::from_code(ErrorCode::InstanceBusy));
    write_frame(&mut client, &msg).await.unwrap();
    let received: Message = read_frame(&mut server).await.unwrap();

    match received {
        Message::Error { id, error, .. } => {
            assert_eq!(id, "r2");
            assert_eq!(error.code, ErrorCode::InstanceBusy);
        }
        other => panic!("unexpected variant: {other:?}"),
    }
}

#[tokio::test]
async fn clean_disconnect_is_reported_as_connection_closed() {
    let (server, client) = loopback_pair().await;
    drop(client);
    let mut server = server;
    let err = read_frame::<_, Message>(&mut server).await.unwrap_err();
    assert!(matches!(err, relay_proto::FrameError::ConnectionClosed));
}
