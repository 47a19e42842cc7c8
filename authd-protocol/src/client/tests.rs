use super::*;
use crate::protocol::{
    decode_envelope, encode_server_message, ErrorKind, Payload, ServerEvent, ServerMessage,
    WireError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

async fn read_envelope(stream: &mut UnixStream) -> RequestEnvelope {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await.unwrap();
    decode_envelope(&buf).unwrap()
}

async fn write_message(stream: &mut UnixStream, msg: &ServerMessage) {
    let frame = encode_server_message(msg).unwrap();
    stream.write_all(&frame).await.unwrap();
}

#[tokio::test]
async fn call_skips_stale_responses_and_buffers_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("authd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let envelope = read_envelope(&mut stream).await;

        // Interleave an event and a stale response before the real reply.
        write_message(
            &mut stream,
            &ServerMessage::Event {
                event: ServerEvent::ReselectAuthMode {
                    session_id: "sess".into(),
                },
            },
        )
        .await;
        write_message(
            &mut stream,
            &ServerMessage::Response {
                id: envelope.id + 100,
                result: Ok(Payload::Done),
            },
        )
        .await;
        write_message(
            &mut stream,
            &ServerMessage::Response {
                id: envelope.id,
                result: Ok(Payload::Brokers(Vec::new())),
            },
        )
        .await;
    });

    let mut client = Client::connect(&path).await.unwrap();
    let brokers = client.available_brokers().await.unwrap();
    assert!(brokers.is_empty());

    match client.take_event() {
        Some(ServerEvent::ReselectAuthMode { session_id }) => assert_eq!(session_id, "sess"),
        other => panic!("Expected buffered reselect event, got {other:?}"),
    }
    assert!(client.take_event().is_none());

    server.await.unwrap();
}

#[tokio::test]
async fn daemon_error_is_surfaced_with_kind() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("authd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let envelope = read_envelope(&mut stream).await;
        write_message(
            &mut stream,
            &ServerMessage::Response {
                id: envelope.id,
                result: Err(WireError::new(ErrorKind::NotFound, "no such user")),
            },
        )
        .await;
    });

    let mut client = Client::connect(&path).await.unwrap();
    let err = client.passwd_by_name("ghost", false).await.unwrap_err();
    let wire = err.wire_error().expect("should be a daemon error");
    assert_eq!(wire.kind, ErrorKind::NotFound);

    server.await.unwrap();
}

#[tokio::test]
async fn server_eof_reports_disconnected() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("authd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_envelope(&mut stream).await;
        // Drop without replying.
    });

    let mut client = Client::connect(&path).await.unwrap();
    let err = client.all_passwds().await.unwrap_err();
    assert!(matches!(err, ClientError::Disconnected));

    server.await.unwrap();
}
