//! Scenario orchestration exercised in loopback (client wired straight to
//! the fake upstream). HTTP/1.1 only: the HTTP/2 handshake needs both ends
//! progressing at once, which the straight-line scenario shape doesn't do
//! without a proxy in the middle.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use proxy_harness::scenario::{router, step};
use proxy_harness::CodecKind;

#[tokio::test]
async fn header_only_exchange_completes_with_empty_bodies() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    router::header_only_request_and_response(&mut harness)
        .await
        .unwrap();
}

#[tokio::test]
async fn bodies_arrive_with_exact_sizes() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    router::request_and_response_with_body(&mut harness, 1024, 512, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn big_request_header_passes_through() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    router::request_and_response_with_body(&mut harness, 64, 16, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn two_sequential_requests_share_one_connection() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    router::two_requests(&mut harness).await.unwrap();
}

#[tokio::test]
async fn explicit_zero_content_length_is_accepted() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    router::valid_zero_length_content(&mut harness).await.unwrap();
}

#[tokio::test]
async fn downstream_disconnect_mid_request_is_seen_upstream() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    router::downstream_disconnect_before_request_complete(&mut harness)
        .await
        .unwrap();
}

#[tokio::test]
async fn actions_run_strictly_in_declared_order() {
    let mut harness = common::loopback_harness(CodecKind::Http1).await;
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    // Later steps finish faster; only strict sequencing keeps the order.
    let first = Arc::clone(&order);
    let second = Arc::clone(&order);
    let third = Arc::clone(&order);
    harness
        .execute_actions(vec![
            step(move |_h| {
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    first.lock().unwrap().push(1);
                    Ok(())
                }
                .boxed_local()
            }),
            step(move |_h| {
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    second.lock().unwrap().push(2);
                    Ok(())
                }
                .boxed_local()
            }),
            step(move |_h| {
                async move {
                    third.lock().unwrap().push(3);
                    Ok(())
                }
                .boxed_local()
            }),
        ])
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}
