use std::net::SocketAddr;
use std::time::Duration;

use sattach_transport::{
    receive_msg, sign_msg, write_msg, AuthCred, DestinationResult, Msg, MsgType, NodeOutcome,
    TaskExitMsg, TcpTransport, Transport, TransportError,
};
use tokio::net::TcpListener;

const KEY: &[u8] = b"test-cluster-key";

/// Accepts one connection, reads one frame and answers with `reply`.
async fn one_shot_server(reply: Msg) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.split();
        let _request = receive_msg(read, Duration::from_secs(2)).await.unwrap();
        write_msg(&mut write, &reply).await.unwrap();
    });
    addr
}

fn request() -> Msg {
    Msg::new(
        MsgType::TaskExit,
        &TaskExitMsg {
            return_code: 0,
            task_ids: vec![0],
        },
        AuthCred::new(1000, 1000),
    )
    .unwrap()
}

fn results_reply() -> Msg {
    let results = vec![
        DestinationResult::success(vec![NodeOutcome {
            node_name: "node1".into(),
            node_id: 0,
        }]),
        DestinationResult::failure(
            2017,
            vec![NodeOutcome {
                node_name: "node2".into(),
                node_id: 1,
            }],
        ),
    ];
    Msg::new(MsgType::ForwardResults, &results, AuthCred::new(0, 0)).unwrap()
}

#[tokio::test]
async fn collects_signed_results() {
    let mut reply = results_reply();
    sign_msg(&mut reply, KEY).unwrap();
    let addr = one_shot_server(reply).await;

    let transport = TcpTransport::new(Some(KEY.to_vec()));
    let results = transport
        .send_and_receive(&request(), addr, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].is_success());
    assert_eq!(results[1].error_code, 2017);
    assert_eq!(results[1].nodes[0].node_name, "node2");
}

#[tokio::test]
async fn rejects_unsigned_reply_when_keyed() {
    let addr = one_shot_server(results_reply()).await;
    let transport = TcpTransport::new(Some(KEY.to_vec()));
    let err = transport
        .send_and_receive(&request(), addr, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::BadSignature));
}

#[tokio::test]
async fn unexpected_reply_type_is_an_error() {
    let addr = one_shot_server(request()).await;
    let transport = TcpTransport::default();
    let err = transport
        .send_and_receive(&request(), addr, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::UnexpectedResponse(MsgType::TaskExit)
    ));
}

#[tokio::test]
async fn refused_connection_names_the_address() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = TcpTransport::default()
        .send_and_receive(&request(), addr, Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        TransportError::Connect { addr: failed, .. } => assert_eq!(failed, addr),
        other => panic!("unexpected error: {}", other),
    }
}
