use std::time::Duration;

use futures_util::StreamExt;
use pretty_assertions::assert_eq;
use stream_channel::{ChannelError, StreamChannel};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fifo_holds_when_producer_and_consumer_interleave() {
    let channel = StreamChannel::new();
    let mut reader = channel.reader().expect("first reader should be granted");
    let producer = channel.clone();

    let produce = tokio::spawn(async move {
        for value in 0..200u32 {
            producer.enqueue(value);
            if value % 7 == 0 {
                tokio::task::yield_now().await;
            }
            if value % 31 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        producer.done();
    });

    let mut received = Vec::new();
    while let Some(value) = reader.next().await.expect("channel should not fail") {
        received.push(value);
    }
    produce.await.expect("producer task should finish");

    assert_eq!(received, (0..200).collect::<Vec<_>>());
}

#[tokio::test]
async fn values_from_cloned_producers_keep_per_call_order() {
    let channel = StreamChannel::new();
    let reader = channel.reader().expect("first reader should be granted");
    let first = channel.clone();
    let second = channel.clone();

    first.enqueue("first-1");
    second.enqueue("second-1");
    first.enqueue("first-2");
    channel.done();

    let values: Vec<_> = reader
        .into_stream()
        .map(|item| item.expect("no failure expected"))
        .collect()
        .await;

    assert_eq!(values, vec!["first-1", "second-1", "first-2"]);
}

#[tokio::test]
async fn stream_adapter_surfaces_error_as_last_item() {
    let channel = StreamChannel::new();
    let reader = channel.reader().expect("first reader should be granted");

    channel.enqueue(1u8);
    channel.error(ChannelError::failed("stream broke"));

    let items: Vec<_> = reader.into_stream().collect().await;
    assert_eq!(
        items,
        vec![Ok(1), Err(ChannelError::failed("stream broke"))]
    );
}
