use pretty_assertions::assert_eq;

use super::*;

#[tokio::test]
async fn events_arrive_in_push_order() {
    let (tx, mut rx) = channel::<i32, &'static str>();
    tx.push(1);
    tx.push(2);
    tx.finish(3, "done");

    assert_eq!(rx.next().await, Some(1));
    assert_eq!(rx.next().await, Some(2));
    assert_eq!(rx.next().await, Some(3));
    assert_eq!(rx.next().await, None);
}

#[tokio::test]
async fn result_waits_for_terminal() {
    let (tx, rx) = channel::<i32, String>();
    let waiter = tokio::spawn({
        let rx = rx.clone();
        async move { rx.result().await }
    });
    tokio::task::yield_now().await;
    tx.push(1);
    tx.finish(2, "value".to_string());
    assert_eq!(waiter.await.unwrap(), Some("value".to_string()));
}

#[tokio::test]
async fn multiple_consumers_see_all_events() {
    let (tx, rx) = channel::<i32, ()>();
    let mut a = rx.subscribe();
    let mut b = rx.subscribe();

    tx.push(10);
    tx.finish(20, ());

    let mut seen_a = Vec::new();
    while let Some(ev) = a.next().await {
        seen_a.push(ev);
    }
    let mut seen_b = Vec::new();
    while let Some(ev) = b.next().await {
        seen_b.push(ev);
    }
    assert_eq!(seen_a, vec![10, 20]);
    assert_eq!(seen_b, seen_a);
}

#[tokio::test]
async fn consumer_blocks_until_pushed() {
    let (tx, mut rx) = channel::<i32, ()>();
    let handle = tokio::spawn(async move { rx.next().await });
    tokio::task::yield_now().await;
    tx.push(7);
    assert_eq!(handle.await.unwrap(), Some(7));
}

#[tokio::test]
async fn dropped_sender_ends_iteration() {
    let (tx, mut rx) = channel::<i32, ()>();
    tx.push(1);
    drop(tx);
    assert_eq!(rx.next().await, Some(1));
    assert_eq!(rx.next().await, None);
    assert_eq!(rx.result().await, None);
}

#[tokio::test]
#[should_panic(expected = "event pushed after terminal event")]
async fn push_after_finish_panics_in_debug() {
    let (tx, _rx) = channel::<i32, ()>();
    tx.finish(0, ());
    tx.push(1);
}
