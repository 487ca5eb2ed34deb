use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinSet};
use turnstile::{AdmissionController, ClientInfo, RejectReason};

fn client(id: impl Into<String>) -> ClientInfo {
    let id = id.into();
    ClientInfo::new("198.51.100.7", format!("/proxy/{id}"), "GET", id)
}

async fn wait_for_queue(controller: &AdmissionController, depth: usize) {
    for _ in 0..400 {
        if controller.queue_len() == depth {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue never reached depth {depth}");
}

#[tokio::test]
async fn release_hands_slot_to_queued_request() {
    let controller = AdmissionController::new(2, Duration::from_secs(5));
    let x = controller.acquire(client("x"), Duration::from_secs(5)).await.unwrap();
    let y = controller.acquire(client("y"), Duration::from_secs(5)).await.unwrap();

    let z = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.acquire(client("z"), Duration::from_secs(5)).await })
    };
    wait_for_queue(&controller, 1).await;
    assert!(!z.is_finished());

    let x_token = x.token();
    x.release();

    let z = z.await.unwrap().unwrap();
    assert!(controller.connection(x_token).is_none());
    assert!(controller.connection(y.token()).is_some());
    assert_eq!(
        controller.connection(z.token()).unwrap().client.correlation_id,
        "z"
    );
    assert_eq!(controller.metrics_snapshot().active_connections, 2);
    assert_eq!(controller.registry_len(), 2);
}

#[tokio::test]
async fn zero_timeout_rejects_at_capacity_without_queueing() {
    let controller = AdmissionController::new(1, Duration::ZERO);
    let _first = controller.acquire_default(client("first")).await.unwrap();
    let before = controller.metrics_snapshot();

    let started = std::time::Instant::now();
    let rejection = controller.acquire_default(client("second")).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(rejection.reason, RejectReason::QueueTimeout);

    let after = controller.metrics_snapshot();
    assert_eq!(after.rejected_connections, before.rejected_connections + 1);
    assert_eq!(after.queued_connections, 0);
    assert_eq!(controller.queue_len(), 0);
}

#[tokio::test]
async fn timed_out_waiter_is_never_promoted() {
    let controller = AdmissionController::new(1, Duration::from_secs(5));
    let held = controller.acquire(client("held"), Duration::ZERO).await.unwrap();

    let rejection = controller
        .acquire(client("late"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(rejection.reason, RejectReason::QueueTimeout);
    assert_eq!(controller.queue_len(), 0);

    held.release();

    let snapshot = controller.metrics_snapshot();
    assert_eq!(controller.registry_len(), 0);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.rejected_connections, 1);
    assert_eq!(snapshot.queued_connections, 0);
}

#[tokio::test]
async fn waiters_are_promoted_in_enqueue_order() {
    let controller = AdmissionController::new(1, Duration::from_secs(5));
    let held = controller.acquire(client("held"), Duration::ZERO).await.unwrap();

    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    let mut waiters = JoinSet::new();
    for i in 0..5 {
        let waiter_controller = controller.clone();
        let order_tx = order_tx.clone();
        waiters.spawn(async move {
            let permit = waiter_controller
                .acquire(client(format!("w{i}")), Duration::from_secs(5))
                .await
                .unwrap();
            order_tx.send(i).unwrap();
            // Dropping the permit passes the slot to the next waiter.
            drop(permit);
        });
        wait_for_queue(&controller, i + 1).await;
    }
    drop(order_tx);

    held.release();
    while waiters.join_next().await.is_some() {}

    let mut order = Vec::new();
    while let Some(i) = order_rx.recv().await {
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.total_requests, 6);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.rejected_connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_connections_never_exceed_limit() {
    const LIMIT: usize = 4;
    const CALLERS: usize = 64;

    let controller = AdmissionController::new(LIMIT, Duration::from_secs(10));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut callers = JoinSet::new();
    for i in 0..CALLERS {
        let controller = controller.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        callers.spawn(async move {
            let permit = controller
                .acquire(client(format!("c{i}")), Duration::from_secs(10))
                .await
                .unwrap();
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(controller.registry_len() <= LIMIT);
            assert!(controller.metrics_snapshot().active_connections <= LIMIT);

            tokio::time::sleep(Duration::from_millis(2)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            permit.release();
        });
    }
    while let Some(result) = callers.join_next().await {
        result.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.total_requests, CALLERS as u64);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.queued_connections, 0);
    assert_eq!(snapshot.rejected_connections, 0);
    assert_eq!(controller.registry_len(), 0);
}

#[tokio::test]
async fn double_release_changes_nothing() {
    let controller = AdmissionController::new(1, Duration::from_secs(1));
    let permit = controller.acquire(client("a"), Duration::ZERO).await.unwrap();
    let token = permit.token();
    permit.release();

    let snapshot = controller.metrics_snapshot();
    assert!(!controller.release(token));
    assert!(!controller.release(turnstile::ConnectionToken::new()));
    assert_eq!(controller.metrics_snapshot(), snapshot);
}

#[tokio::test]
async fn cancelled_waiter_does_not_take_a_slot() {
    let controller = AdmissionController::new(1, Duration::from_secs(5));
    let held = controller.acquire(client("held"), Duration::ZERO).await.unwrap();

    let gone = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.acquire(client("gone"), Duration::from_secs(5)).await })
    };
    wait_for_queue(&controller, 1).await;
    let next = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.acquire(client("next"), Duration::from_secs(5)).await })
    };
    wait_for_queue(&controller, 2).await;

    gone.abort();
    let _ = gone.await;
    assert_eq!(controller.queue_len(), 1);

    held.release();
    let next = next.await.unwrap().unwrap();
    assert_eq!(next.connection().unwrap().client.correlation_id, "next");
    assert_eq!(controller.registry_len(), 1);
}

#[tokio::test]
async fn average_response_time_matches_totals() {
    let controller = AdmissionController::new(3, Duration::from_secs(1));
    for i in 0..3 {
        let permit = controller
            .acquire(client(format!("r{i}")), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        permit.release();
    }

    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.total_requests, 3);
    assert!(snapshot.total_response_time >= 0.03);
    let expected = snapshot.total_response_time / 3.0;
    assert!((snapshot.avg_response_time - expected).abs() < 1e-9);
}

async fn yield_until_queued(controller: &AdmissionController, depth: usize) {
    while controller.queue_len() < depth {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn release_skips_waiter_whose_deadline_passed_unnoticed() {
    let controller = AdmissionController::new(1, Duration::from_secs(5));
    let held = controller.acquire(client("held"), Duration::ZERO).await.unwrap();

    let late = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .acquire(client("late"), Duration::from_millis(30))
                .await
        })
    };
    yield_until_queued(&controller, 1).await;

    // Block the only runtime thread so the waiter's own timer cannot fire
    // before the release sees it.
    std::thread::sleep(Duration::from_millis(60));
    held.release();

    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.rejected_connections, 1);
    assert_eq!(snapshot.queued_connections, 0);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(controller.registry_len(), 0);

    let rejection = late.await.unwrap().unwrap_err();
    assert_eq!(rejection.reason, RejectReason::QueueTimeout);
    assert_eq!(rejection.queue_depth, 0);

    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.rejected_connections, 1);
    assert_eq!(snapshot.total_requests, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn promoted_waiter_aborted_before_wakeup_frees_its_slot() {
    let controller = AdmissionController::new(1, Duration::from_secs(5));
    let held = controller.acquire(client("held"), Duration::ZERO).await.unwrap();

    let waiter = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.acquire(client("waiter"), Duration::from_secs(5)).await })
    };
    yield_until_queued(&controller, 1).await;

    held.release();
    // The slot now belongs to the waiter, which has not run since.
    assert_eq!(controller.registry_len(), 1);
    assert_eq!(controller.metrics_snapshot().active_connections, 1);

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());

    assert_eq!(controller.registry_len(), 0);
    let snapshot = controller.metrics_snapshot();
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.queued_connections, 0);
    assert_eq!(snapshot.total_requests, 2);

    let fresh = controller.acquire(client("fresh"), Duration::ZERO).await;
    assert!(fresh.is_ok());
}
