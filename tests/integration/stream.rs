use crate::*;

use tether_channel::duplex::{ByteDuplex, Framing, StreamDuplex};
use tether_channel::facade::{RemoteNode, TaskRegistry};
use tether_channel::object::Value;
use tether_channel::rpc::RpcError;
use tether_core::config::TetherConfig;

/// Two stream duplexes joined by an in-process tokio byte pipe.
fn stream_pair(framing: Framing) -> (Arc<StreamDuplex>, Arc<StreamDuplex>) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    (
        Arc::new(StreamDuplex::from_stream("left", left, framing)),
        Arc::new(StreamDuplex::from_stream("right", right, framing)),
    )
}

async fn pipes_over(framing: Framing) {
    let receiver = Arc::new(Recorder::default());
    let a = blob_pipe("a");
    let b = blob_pipe("b");
    b.bind(receiver.clone()).unwrap();
    let (x, y) = stream_pair(framing);
    a.attach_stream(x).unwrap();
    b.attach_stream(y).unwrap();

    let large = Bytes::from(vec![0xAB; 200_000]);
    let deliveries = vec![
        a.send(Bytes::from_static(b"small")),
        a.send(large.clone()),
        a.send(Bytes::new()),
    ];
    let results = within(futures::future::join_all(deliveries)).await;
    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(
        receiver.received(),
        vec![Bytes::from_static(b"small"), large, Bytes::new()]
    );
}

#[tokio::test]
async fn test_pipe_over_raw_stream() {
    pipes_over(Framing::Raw).await;
}

#[tokio::test]
async fn test_pipe_over_enveloped_stream() {
    // A small chunk capacity forces multi-chunk envelopes.
    pipes_over(Framing::Envelope { chunk_capacity: 512 }).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_node_over_enveloped_stream() {
    let config = TetherConfig::default();
    let framing = Framing::Envelope {
        chunk_capacity: config.envelope.chunk_capacity,
    };

    let singletons = Singletons::new();
    TaskRegistry::new()
        .computation("concat", |args| {
            let joined: String = args.iter().filter_map(Value::as_str).collect();
            Ok(Value::from(joined))
        })
        .install(&singletons)
        .unwrap();

    let controller = RpcChannel::builder("controller")
        .config(config.clone())
        .build()
        .unwrap();
    let agent = RpcChannel::builder("agent")
        .config(config)
        .singletons(singletons)
        .build()
        .unwrap();
    let (x, y) = stream_pair(framing);
    controller.attach_stream(x).unwrap();
    agent.attach_stream(y).unwrap();

    let node = RemoteNode::new(controller);
    let joined = within(node.submit("concat", vec!["te".into(), "th".into(), "er".into()]))
        .await
        .unwrap();
    assert_eq!(joined, Value::from("tether"));
}

#[tokio::test]
async fn test_peer_eof_without_reconnect_ends_composition() {
    let mut config = TetherConfig::default().pipe;
    config.reconnect = false;
    let supervisor = Supervisor::new("a");
    let a = BlobPipe::new("a", config, supervisor.clone()).unwrap();
    let pending = a.send(Bytes::from_static(b"orphan"));

    let (left, right) = tokio::io::duplex(1024);
    a.attach_stream(Arc::new(StreamDuplex::from_stream("left", left, Framing::Raw)))
        .unwrap();
    drop(right);

    within(supervisor.terminated()).await;
    assert!(a.is_closed());
    assert!(within(pending).await.is_err());
}

fn square_agent(config: TetherConfig) -> RpcChannel {
    let singletons = Singletons::new();
    TaskRegistry::new()
        .computation("square", |args| {
            let x = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(Value::Int(x * x))
        })
        .install(&singletons)
        .unwrap();
    RpcChannel::builder("agent")
        .config(config)
        .singletons(singletons)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_channel_waits_for_replacement_stream() {
    let controller = RpcChannel::builder("controller").build().unwrap();
    let agent = square_agent(TetherConfig::default());
    let (x, y) = MemoryDuplex::pair();
    controller.attach_stream(x).unwrap();
    agent.attach_stream(y.clone()).unwrap();
    // The agent's end goes away cleanly; the controller sees EOF.
    y.close();

    let node = RemoteNode::new(controller.clone());
    let pending = node.submit("square", vec![6.into()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!controller.is_terminated());
    assert_eq!(controller.pending_calls(), 1);

    let (x, y) = MemoryDuplex::pair();
    controller.attach_stream(x).unwrap();
    agent.attach_stream(y).unwrap();
    assert_eq!(within(pending).await, Ok(Value::Int(36)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_without_reconnect_fails_calls_on_eof() {
    let mut config = TetherConfig::default();
    config.pipe.reconnect = false;
    let controller = RpcChannel::builder("controller")
        .config(config.clone())
        .build()
        .unwrap();
    let agent = square_agent(config);
    let (left, right) = tokio::io::duplex(64 * 1024);
    controller
        .attach_stream(Arc::new(StreamDuplex::from_stream("left", left, Framing::Raw)))
        .unwrap();
    agent
        .attach_stream(Arc::new(StreamDuplex::from_stream("right", right, Framing::Raw)))
        .unwrap();

    let node = RemoteNode::new(controller.clone());
    assert_eq!(within(node.submit("square", vec![3.into()])).await, Ok(Value::Int(9)));

    // The peer exits cleanly.
    agent.close();
    within(controller.terminated()).await;
    assert_eq!(
        within(node.submit("square", vec![3.into()])).await,
        Err(RpcError::Closed)
    );
}
