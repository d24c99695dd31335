//! Byte-fidelity tests for the local TCP shuttle
//!
//! Runs a real local listener and checks that bytes cross the stream in
//! both directions exactly as written, and that close frames follow the
//! data that preceded them.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tunlify_client::tcp::{run_stream, LocalTcpEvent};
use tunlify_proto::ControlMessage;

#[tokio::test]
async fn test_bytes_cross_in_order_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();

    // Local endpoint: reads 14 bytes, echoes a banner, closes.
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 14];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(b"SSH-2.0-server\r\n").await.unwrap();
        buf
    });

    let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(64);
    let (events_tx, events_rx) = mpsc::channel::<LocalTcpEvent>(64);

    let stream = tokio::spawn(run_stream(
        "conn-1".to_string(),
        target,
        out_tx,
        events_rx,
    ));

    // First frame out must be the ack.
    match out_rx.recv().await.unwrap() {
        ControlMessage::TcpConnectAck { connection_id } => assert_eq!(connection_id, "conn-1"),
        other => panic!("expected ack, got {:?}", other),
    }

    // Gateway pushes the inbound bytes, split across frames.
    events_tx
        .send(LocalTcpEvent::Data(b"SSH-2.0".to_vec()))
        .await
        .unwrap();
    events_tx
        .send(LocalTcpEvent::Data(b"-test\r\n".to_vec()))
        .await
        .unwrap();

    // The local endpoint saw the concatenation of the writes.
    assert_eq!(server.await.unwrap(), b"SSH-2.0-test\r\n".to_vec());

    // Whatever the endpoint wrote comes back verbatim, then the close,
    // strictly after the data.
    let mut returned = Vec::new();
    let mut closed = false;
    while let Some(frame) = out_rx.recv().await {
        match frame {
            ControlMessage::TcpData { data, .. } => {
                assert!(!closed, "data after close");
                returned.extend_from_slice(&data);
            }
            ControlMessage::TcpClose { .. } => {
                closed = true;
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert!(closed);
    assert_eq!(returned, b"SSH-2.0-server\r\n".to_vec());

    drop(events_tx);
    stream.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_target_reports_tcp_error() {
    // A port that nothing listens on: bind, learn the port, drop.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = probe.local_addr().unwrap().to_string();
    drop(probe);

    let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(16);
    let (_events_tx, events_rx) = mpsc::channel::<LocalTcpEvent>(16);

    run_stream("conn-2".to_string(), target, out_tx, events_rx).await;

    match out_rx.recv().await.unwrap() {
        ControlMessage::TcpError { connection_id, .. } => assert_eq!(connection_id, "conn-2"),
        other => panic!("expected tcp_error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_event_half_closes_local_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Read to EOF: the shuttle's shutdown must deliver it.
        let mut buf = Vec::new();
        socket.read_to_end(&mut buf).await.unwrap();
        buf
    });

    let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(16);
    let (events_tx, events_rx) = mpsc::channel::<LocalTcpEvent>(16);

    let stream = tokio::spawn(run_stream(
        "conn-3".to_string(),
        target,
        out_tx,
        events_rx,
    ));

    assert!(matches!(
        out_rx.recv().await.unwrap(),
        ControlMessage::TcpConnectAck { .. }
    ));

    events_tx
        .send(LocalTcpEvent::Data(b"bye".to_vec()))
        .await
        .unwrap();
    events_tx.send(LocalTcpEvent::Close).await.unwrap();

    assert_eq!(server.await.unwrap(), b"bye".to_vec());
    stream.await.unwrap();
}
