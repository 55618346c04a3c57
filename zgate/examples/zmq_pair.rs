//! Two libzmq PAIR sockets exchanging messages through zgate.
//!
//! Run with:
//!
//! ```text
//! RUST_LOG=zgate_core=debug cargo run -p zgate --example zmq_pair --features zmq
//! ```

use std::time::Duration;
use zgate::prelude::*;

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    zgate::dev_tracing::init_tracing();

    let ctx = zmq::Context::new();
    let server = ctx.socket(zmq::PAIR)?;
    let client = ctx.socket(zmq::PAIR)?;
    server.bind("inproc://zgate-demo")?;
    client.connect("inproc://zgate-demo")?;

    // One monitor thread for both sockets.
    let monitor = Monitor::spawn(MonitorConfig::default())?;
    let server = AsyncSocket::with_monitor(server, monitor.clone(), SocketOptions::default());
    let client = AsyncSocket::with_monitor(
        client,
        monitor.clone(),
        SocketOptions::new().with_recv_timeout(Duration::from_secs(1)),
    );
    let _server = server.enter()?;
    let _client = client.enter()?;

    let serve = async {
        for _ in 0..3 {
            let request = server.arecv(0).await?;
            println!("server got {:?}", request);
            server.asend(request, 0).await?;
        }
        Ok::<_, ZgateError>(())
    };
    let talk = async {
        for word in ["Hello", "from", "zgate"] {
            client.asend(Bytes::from(word), 0).await?;
            let reply = client.arecv(0).await?;
            println!("client got {:?}", reply);
        }
        Ok::<_, ZgateError>(())
    };

    let (served, talked) = futures::join!(serve, talk);
    served?;
    talked?;

    let events: Vec<String> = monitor.events().drain().map(|e| e.to_string()).collect();
    println!("monitor events: {events:?}");
    Ok(())
}
