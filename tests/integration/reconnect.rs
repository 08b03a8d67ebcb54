use crate::*;

use tether_channel::duplex::MemoryDuplex;
use tether_core::wire::MessageId;

fn blob(i: u32) -> Bytes {
    Bytes::from(format!("blob-{i}"))
}

/// Swap both ends of the link for a fresh pair.
fn reattach(a: &BlobPipe, b: &BlobPipe) {
    let (x, y) = MemoryDuplex::pair();
    a.attach_stream(x).unwrap();
    b.attach_stream(y).unwrap();
}

#[tokio::test]
async fn test_unacknowledged_message_survives_stream_swap() {
    let receiver = Arc::new(Recorder::default());
    let (a, b, x, _y) = pipe_pair(receiver.clone());

    for i in 0..7 {
        within(a.send(blob(i))).await.unwrap();
    }
    wait_until(|| b.inbound_pending() == 0).await;

    x.sever();
    let eighth = a.send(blob(7));
    assert_eq!(eighth.id(), Some(MessageId::new(7)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(receiver.count(b"blob-7"), 0);
    assert_eq!(a.in_flight(), 1);

    reattach(&a, &b);
    within(eighth).await.unwrap();
    assert_eq!(receiver.count(b"blob-7"), 1);
    assert_eq!(receiver.received().len(), 8);
}

#[tokio::test]
async fn test_swap_mid_transfer_loses_and_duplicates_nothing() {
    let receiver = Arc::new(Recorder::default());
    let (a, b, x, _y) = pipe_pair(receiver.clone());

    let mut deliveries: Vec<_> = (0..40).map(|i| a.send(blob(i))).collect();
    // Cut the link while the first batch may be anywhere between sent and
    // acknowledged.
    x.sever();
    deliveries.extend((40..80).map(|i| a.send(blob(i))));

    reattach(&a, &b);
    let results = within(futures::future::join_all(deliveries)).await;
    assert!(results.iter().all(Result::is_ok), "{results:?}");

    for i in 0..80 {
        assert_eq!(receiver.count(format!("blob-{i}").as_bytes()), 1, "blob-{i}");
    }
    assert_eq!(a.in_flight(), 0);
    wait_until(|| b.inbound_pending() == 0).await;
}

#[tokio::test]
async fn test_repeated_swaps_keep_the_pipe_alive() {
    let receiver = Arc::new(Recorder::default());
    let (a, b, x, _y) = pipe_pair(receiver.clone());
    x.sever();

    let mut deliveries = Vec::new();
    for round in 0..5u32 {
        deliveries.push(a.send(blob(round)));
        reattach(&a, &b);
    }
    let results = within(futures::future::join_all(deliveries)).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(receiver.received().len(), 5);
    assert!(!a.supervisor().is_terminated());
    assert!(!b.supervisor().is_terminated());
}

#[tokio::test]
async fn test_replaced_stream_is_closed() {
    let receiver = Arc::new(Recorder::default());
    let (a, b, x, _y) = pipe_pair(receiver);
    reattach(&a, &b);

    use tether_channel::duplex::ByteDuplex;
    assert!(x.write(Bytes::from_static(b"late")).is_err());
}
