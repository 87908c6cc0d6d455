use super::*;
use crate::frame::{Data, MessageType};
use tokio::time::{Duration, timeout};
use uuid::Uuid;

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

fn chat(n: usize) -> Frame {
    Frame::request(MessageType::Chat, Data::new()).with_data("n", n)
}

#[tokio::test]
async fn publish_reaches_every_subscriber_and_stamps_topic() {
    let router = TopicRouter::new();
    let topic = Topic::chat("ROOM01");
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    router.subscribe(a, &topic, tx_a).await.unwrap();
    router.subscribe(b, &topic, tx_b).await.unwrap();

    let delivery = router.publish(&topic, chat(1)).await;

    assert_eq!(delivery, Delivery { delivered: 2, dropped: 0 });
    assert_eq!(recv_frame(&mut rx_a).await.topic.as_deref(), Some("room/ROOM01/chat"));
    assert_eq!(recv_frame(&mut rx_b).await.topic.as_deref(), Some("room/ROOM01/chat"));
}

#[tokio::test]
async fn publish_except_skips_excluded_connection() {
    let router = TopicRouter::new();
    let topic = Topic::code("ROOM01");
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    router.subscribe(a, &topic, tx_a).await.unwrap();
    router.subscribe(b, &topic, tx_b).await.unwrap();

    let delivery = router.publish_except(&topic, chat(1), Some(a)).await;

    assert_eq!(delivery.delivered, 1);
    recv_frame(&mut rx_b).await;
    assert_no_frame(&mut rx_a).await;
}

#[tokio::test]
async fn publishes_arrive_in_accept_order() {
    let router = TopicRouter::new();
    let topic = Topic::chat("ROOM01");
    let (tx, mut rx) = mpsc::channel(64);
    router.subscribe(Uuid::new_v4(), &topic, tx).await.unwrap();

    for n in 0..20 {
        router.publish(&topic, chat(n)).await;
    }

    for n in 0..20 {
        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.data.get("n").and_then(serde_json::Value::as_u64), Some(n));
    }
}

#[tokio::test]
async fn full_queue_drops_for_that_subscriber_only() {
    let router = TopicRouter::new();
    let topic = Topic::chat("ROOM01");
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    let (fast_tx, mut fast_rx) = mpsc::channel(8);
    router.subscribe(Uuid::new_v4(), &topic, slow_tx).await.unwrap();
    router.subscribe(Uuid::new_v4(), &topic, fast_tx).await.unwrap();

    router.publish(&topic, chat(1)).await;
    let second = router.publish(&topic, chat(2)).await;

    assert_eq!(second, Delivery { delivered: 1, dropped: 1 });
    recv_frame(&mut fast_rx).await;
    recv_frame(&mut fast_rx).await;
}

#[tokio::test]
async fn closed_queue_counts_as_dropped() {
    let router = TopicRouter::new();
    let topic = Topic::presence("ROOM01");
    let (tx, rx) = mpsc::channel(8);
    router.subscribe(Uuid::new_v4(), &topic, tx).await.unwrap();
    drop(rx);

    let delivery = router.publish(&topic, chat(1)).await;

    assert_eq!(delivery, Delivery { delivered: 0, dropped: 1 });
}

#[tokio::test]
async fn private_topic_rejects_foreign_subscriber() {
    let router = TopicRouter::new();
    let owner = Uuid::new_v4();
    let topic = Topic::execution_output(owner);
    let (tx, _rx) = mpsc::channel(8);

    let err = router.subscribe(Uuid::new_v4(), &topic, tx.clone()).await;
    assert!(matches!(err, Err(RouterError::NotOwner { .. })));
    router.subscribe(owner, &topic, tx).await.unwrap();
    assert_eq!(router.subscriber_count(&topic).await, 1);
}

#[tokio::test]
async fn unsubscribe_removes_subscriber_and_empty_topic() {
    let router = TopicRouter::new();
    let conn = Uuid::new_v4();
    let topics = [Topic::chat("ROOM01"), Topic::code("ROOM01")];
    let (tx, mut rx) = mpsc::channel(8);
    for topic in &topics {
        router.subscribe(conn, topic, tx.clone()).await.unwrap();
    }

    router.unsubscribe_all(conn, &topics).await;

    for topic in &topics {
        assert_eq!(router.subscriber_count(topic).await, 0);
        assert_eq!(router.publish(topic, chat(1)).await, Delivery::default());
    }
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn rooms_are_isolated_per_topic_name() {
    let router = TopicRouter::new();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    router.subscribe(Uuid::new_v4(), &Topic::chat("ROOMAA"), tx_a).await.unwrap();
    router.subscribe(Uuid::new_v4(), &Topic::chat("ROOMBB"), tx_b).await.unwrap();

    router.publish(&Topic::chat("ROOMAA"), chat(1)).await;

    recv_frame(&mut rx_a).await;
    assert_no_frame(&mut rx_b).await;
}
