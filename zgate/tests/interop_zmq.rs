//! libzmq sockets driven through the async facade.

use std::time::Duration;
use zgate::prelude::*;
use zgate::SocketType;

fn zmq_pair(ctx: &zmq::Context, endpoint: &str) -> (zmq::Socket, zmq::Socket) {
    let server = ctx.socket(zmq::PAIR).unwrap();
    let client = ctx.socket(zmq::PAIR).unwrap();
    server.set_linger(0).unwrap();
    client.set_linger(0).unwrap();
    server.bind(endpoint).unwrap();
    client.connect(endpoint).unwrap();
    (server, client)
}

#[compio::test]
async fn test_interop_pair_hello() {
    zgate::dev_tracing::init_tracing();
    let ctx = zmq::Context::new();
    let (server, client) = zmq_pair(&ctx, "inproc://zgate-interop-hello");
    let server = AsyncSocket::new(server);
    let client = AsyncSocket::new(client);
    let _s = server.enter().unwrap();
    let _c = client.enter().unwrap();
    assert_eq!(server.socket_type().unwrap(), SocketType::Pair);

    let recv = server.arecv(0);
    let send = async {
        compio::time::sleep(Duration::from_millis(20)).await;
        client.asend(Bytes::from_static(b"Hello"), 0).await.unwrap();
    };
    let (msg, ()) = futures::join!(recv, send);
    assert_eq!(msg.unwrap(), Bytes::from_static(b"Hello"));

    server
        .asend_multipart(vec![Bytes::from_static(b"World"), Bytes::from_static(b"!")], 0)
        .await
        .unwrap();
    assert_eq!(
        client.arecv_multipart(0).await.unwrap(),
        vec![Bytes::from_static(b"World"), Bytes::from_static(b"!")]
    );
}

#[compio::test]
async fn test_interop_over_tcp_with_plain_peer() {
    let ctx = zmq::Context::new();
    let server = ctx.socket(zmq::PAIR).unwrap();
    server.set_linger(0).unwrap();
    server.bind("tcp://127.0.0.1:*").unwrap();
    let endpoint = server.get_last_endpoint().unwrap().unwrap();

    let client = ctx.socket(zmq::PAIR).unwrap();
    client.set_linger(0).unwrap();
    client.connect(&endpoint).unwrap();

    let server = AsyncSocket::new(server);
    let _s = server.enter().unwrap();

    let peer = std::thread::spawn(move || {
        let msg = client.recv_bytes(0).unwrap();
        client.send(&msg[..], 0).unwrap();
        client
    });

    server.asend(Bytes::from_static(b"echo me"), 0).await.unwrap();
    let echoed = server.arecv(0).await.unwrap();
    assert_eq!(echoed, Bytes::from_static(b"echo me"));
    drop(peer.join().unwrap());
}

#[compio::test]
async fn test_interop_apoll_and_timeout() {
    let ctx = zmq::Context::new();
    let (server, _client) = zmq_pair(&ctx, "inproc://zgate-interop-poll");
    let server = AsyncSocket::with_options(
        server,
        SocketOptions::new().with_recv_timeout(Duration::from_millis(30)),
    );
    let _s = server.enter().unwrap();

    let ready = server
        .apoll(Events::READABLE, Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(ready.is_empty());
    assert!(matches!(server.arecv(0).await, Err(ZgateError::Timeout(_))));
}
