//! Multi-caller integration tests.
//!
//! These tests exercise the coordination primitives under concurrent
//! callers to verify the crate-level guarantees: at-most-one execution per
//! logical unit, correct cancellation of superseded work, and one
//! consistent outcome for every caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::join_all;
use syncflight::{EventBus, KeyedSingleFlight, Loader, Mutator, SingleFlight};
use tokio::task::yield_now;
use tokio::time::sleep;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scenario 1: many concurrent callers of one single-flight operation.
///
/// Question: does exactly one execution happen, with every caller seeing
/// the same outcome?
#[tokio::test(start_paused = true)]
async fn test_eight_callers_one_execution() {
    init_logging();
    let executions = Arc::new(AtomicU32::new(0));
    let flight = {
        let executions = executions.clone();
        SingleFlight::new(move || {
            let executions = executions.clone();
            async move {
                sleep(Duration::from_millis(200)).await;
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        })
    };

    let callers = (0..8).map(|_| {
        let flight = flight.clone();
        tokio::spawn(async move { flight.sync().await })
    });
    let results = join_all(callers).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap(), 7);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(!flight.is_syncing());
}

/// Scenario 2: keyed fan-out before any completion.
///
/// Question: do four concurrent callers of the same key share one
/// execution, with the key's loading flag transitioning exactly once?
#[tokio::test(start_paused = true)]
async fn test_keyed_batch_shares_one_execution() {
    init_logging();
    let flights = KeyedSingleFlight::new();
    let executions = Arc::new(AtomicU32::new(0));

    let mut gate = flights.syncing("k");
    assert_eq!(gate.next().await, Some(false));

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let flights = flights.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                flights
                    .sync("k", async move {
                        sleep(Duration::from_secs(5)).await;
                        executions.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        })
        .collect();

    assert_eq!(gate.next().await, Some(true));
    assert_eq!(gate.next().await, Some(false));

    for result in join_all(callers).await {
        assert_eq!(result.unwrap().unwrap(), 1);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // The registration was transient: a fresh sync runs its own body.
    let reran = flights.sync("k", async { Ok(2) }).await.unwrap();
    assert_eq!(reran, 2);
}

/// Scenario 3: loader lifecycle across success and preemption.
///
/// Question: does the recorded state follow completed loads only, with the
/// preempted caller observing cancellation?
#[tokio::test(start_paused = true)]
async fn test_loader_lifecycle() {
    init_logging();
    let loader = Loader::new();

    let first = loader.load(|_| async { Ok(1) }).await;
    assert_eq!(first.unwrap(), 1);
    assert!(loader.state().last_result.unwrap().is_ok());

    let stalled = {
        let loader = loader.clone();
        tokio::spawn(async move {
            loader
                .load(|_| async {
                    sleep(Duration::from_secs(3600)).await;
                    Ok(0)
                })
                .await
        })
    };
    while !loader.is_loading() {
        yield_now().await;
    }

    let second = loader.load(|_| async { Ok(2) }).await;
    assert_eq!(second.unwrap(), 2);
    assert!(stalled.await.unwrap().unwrap_err().is_cancelled());

    assert!(!loader.is_loading());
    assert!(loader.state().last_result.unwrap().is_ok());
}

/// Scenario 4: effect storm on one coordinator.
///
/// Question: is at most one lane body ever inside the lock, and do effects
/// all run to completion without cancelling each other?
#[tokio::test(start_paused = true)]
async fn test_effect_storm_stays_exclusive() {
    init_logging();
    let mutator = Arc::new(Mutator::new());
    let occupancy = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicU32::new(0));

    let effects = (0..6).map(|_| {
        let mutator = mutator.clone();
        let occupancy = occupancy.clone();
        let completed = completed.clone();
        tokio::spawn(async move {
            mutator
                .effect(async {
                    assert_eq!(occupancy.fetch_add(1, Ordering::SeqCst), 0);
                    sleep(Duration::from_millis(50)).await;
                    occupancy.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        })
    });

    for result in join_all(effects).await {
        result.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 6);
    assert_eq!(occupancy.load(Ordering::SeqCst), 0);
}

/// Scenario 5: event bus under concurrent publishers.
///
/// Question: do typed subscribers see events from every publisher?
#[tokio::test]
async fn test_concurrent_event_publishing() {
    init_logging();

    #[derive(Debug, Clone)]
    struct Loaded(u32);

    let bus = EventBus::new();
    let mut stream = bus.subscribe::<Loaded>();

    let publishers = (0..5).map(|publisher| {
        let bus = bus.clone();
        tokio::spawn(async move {
            for i in 0..10 {
                bus.publish(Loaded(publisher * 10 + i));
                yield_now().await;
            }
        })
    });
    join_all(publishers).await;

    let mut received = 0;
    while stream.try_recv().is_some() {
        received += 1;
    }
    assert_eq!(received, 50);
}
