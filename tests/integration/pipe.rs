use crate::*;

use tether_channel::pipe::PipeError;

#[tokio::test]
async fn test_send_hello_is_delivered_once() {
    let receiver = Arc::new(Recorder::default());
    let (a, _b, _x, _y) = pipe_pair(receiver.clone());

    within(a.send(Bytes::from_static(b"hello"))).await.unwrap();
    assert_eq!(receiver.received(), vec![Bytes::from_static(b"hello")]);
}

#[tokio::test]
async fn test_refusal_reason_reaches_sender() {
    let receiver = Arc::new(Recorder::refusing(b"big", "disk full"));
    let (a, _b, _x, _y) = pipe_pair(receiver.clone());

    let err = within(a.send(Bytes::from_static(b"big"))).await.unwrap_err();
    match err {
        PipeError::Rejected { reason, .. } => assert_eq!(reason, "disk full"),
        other => panic!("expected rejection, got {other:?}"),
    }

    // A refusal does not poison the pipe.
    within(a.send(Bytes::from_static(b"small"))).await.unwrap();
    assert_eq!(receiver.count(b"small"), 1);
}

#[tokio::test]
async fn test_every_send_resolves_exactly_once_in_order() {
    let receiver = Arc::new(Recorder::default());
    let (a, b, _x, _y) = pipe_pair(receiver.clone());

    let deliveries: Vec<_> = (0..200u32)
        .map(|i| a.send(Bytes::from(i.to_be_bytes().to_vec())))
        .collect();
    let results = within(futures::future::join_all(deliveries)).await;
    assert!(results.iter().all(Result::is_ok));

    let expected: Vec<Bytes> = (0..200u32)
        .map(|i| Bytes::from(i.to_be_bytes().to_vec()))
        .collect();
    assert_eq!(receiver.received(), expected);
    assert_eq!(a.in_flight(), 0);
    wait_until(|| b.inbound_pending() == 0).await;
}

#[tokio::test]
async fn test_both_directions_share_one_stream() {
    let left = Arc::new(Recorder::default());
    let right = Arc::new(Recorder::default());
    let a = blob_pipe("left");
    let b = blob_pipe("right");
    a.bind(left.clone()).unwrap();
    b.bind(right.clone()).unwrap();
    let (x, y) = tether_channel::duplex::MemoryDuplex::pair();
    a.attach_stream(x).unwrap();
    b.attach_stream(y).unwrap();

    let (ab, ba) = within(futures::future::join(
        a.send(Bytes::from_static(b"to right")),
        b.send(Bytes::from_static(b"to left")),
    ))
    .await;
    ab.unwrap();
    ba.unwrap();
    assert_eq!(right.received(), vec![Bytes::from_static(b"to right")]);
    assert_eq!(left.received(), vec![Bytes::from_static(b"to left")]);
}

#[tokio::test]
async fn test_supervisor_teardown_closes_every_pipe() {
    let supervisor = Supervisor::new("composition");
    let a = BlobPipe::new("a", PipeConfig::default(), supervisor.clone()).unwrap();
    let b = BlobPipe::new("b", PipeConfig::default(), supervisor.clone()).unwrap();
    let pending = a.send(Bytes::from_static(b"stranded"));

    supervisor.fatal("test", "simulated failure");
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(within(pending).await, Err(PipeError::Closed));
}
