//! End-to-end scenarios driving [`Consumer`] against [`MockDriver`], the way
//! `kafka-deduplicator`'s `rebalance_e2e_integration_tests.rs` drives its
//! consumer against a scripted broker double rather than unit-testing each
//! collaborator in isolation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use stream_consumer_core::attachments::{AttachedProducer, DeliveryFuture};
use stream_consumer_core::config::EngineConfig;
use stream_consumer_core::driver::Record;
use stream_consumer_core::error::ProducerFlushError;
use stream_consumer_core::test_support::MockDriver;
use stream_consumer_core::topic_partition::TopicPartition;
use stream_consumer_core::{Consumer, ConsumerCallbacks, Message};

fn tp(topic: &str, partition: i32) -> TopicPartition {
    TopicPartition::new(topic, partition)
}

fn rec(tp: TopicPartition, offset: i64) -> Record {
    Record { tp, offset, key: None, value: None, timestamp: None }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        broker_commit_interval_secs: 3600,
        broker_commit_livelock_soft_timeout_secs: 3600,
        broker_commit_every: None,
        stream_wait_empty: true,
    }
}

/// Same as [`engine_config`] but with draining on stop disabled: used by
/// tests that deliberately withhold an ack forever, where `wait_empty`
/// would otherwise block `stop()` indefinitely waiting for `unacked` to
/// drain.
fn engine_config_no_drain() -> EngineConfig {
    EngineConfig { stream_wait_empty: false, ..engine_config() }
}

#[tokio::test]
async fn out_of_order_acks_collapse_to_a_contiguous_commit_watermark() {
    let t = tp("orders", 0);
    let mut batch = HashMap::new();
    batch.insert(t.clone(), vec![rec(t.clone(), 0), rec(t.clone(), 1), rec(t.clone(), 2), rec(t.clone(), 4)]);
    let driver = Arc::new(MockDriver::with_single_batch(batch));

    let acked_messages: Arc<std::sync::Mutex<Vec<Arc<Message>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = acked_messages.clone();

    let callback: stream_consumer_core::fetcher::RecordCallback = Arc::new(move |msg| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(msg);
        })
    });

    let consumer = Consumer::new(
        driver.clone(),
        vec!["orders".into()],
        engine_config_no_drain(),
        ConsumerCallbacks {
            on_message: callback,
            on_rebalance_start: None,
            on_partitions_revoked: None,
            on_partitions_assigned: None,
            producer: None,
        },
    )
    .await
    .unwrap();

    let run_handle = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    // Wait until the fetcher has dispatched all four records.
    for _ in 0..200 {
        if acked_messages.lock().unwrap().len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(acked_messages.lock().unwrap().len(), 4);

    // Ack offsets 0, 2, 1 out of order (4 is withheld), then commit.
    let messages = acked_messages.lock().unwrap().clone();
    let by_offset: HashMap<i64, Arc<Message>> =
        messages.into_iter().map(|m| (m.offset, m)).collect();
    for offset in [0, 2, 1] {
        consumer.ack(&by_offset[&offset]).await;
    }

    consumer.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), run_handle).await;

    // 4 was never acked, so the watermark stops at 2, not 4.
    let commits = driver.commit_log();
    assert_eq!(commits.last(), Some(&HashMap::from([(t.clone(), 2)])));
}

#[tokio::test]
async fn revoked_partition_is_excluded_from_the_next_commit() {
    let kept = tp("orders", 0);
    let dropped = tp("orders", 1);
    let mut batch = HashMap::new();
    batch.insert(kept.clone(), vec![rec(kept.clone(), 0)]);
    batch.insert(dropped.clone(), vec![rec(dropped.clone(), 0)]);
    let driver = Arc::new(MockDriver::with_single_batch(batch));

    let acked_messages: Arc<std::sync::Mutex<Vec<Arc<Message>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = acked_messages.clone();
    let callback: stream_consumer_core::fetcher::RecordCallback = Arc::new(move |msg| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(msg);
        })
    });

    let consumer = Consumer::new(
        driver.clone(),
        vec!["orders".into()],
        engine_config(),
        ConsumerCallbacks {
            on_message: callback,
            on_rebalance_start: None,
            on_partitions_revoked: None,
            on_partitions_assigned: None,
            producer: None,
        },
    )
    .await
    .unwrap();

    let run_handle = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    for _ in 0..200 {
        if acked_messages.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = acked_messages.lock().unwrap().clone();
    for m in &messages {
        consumer.ack(m).await;
    }

    // Revoke the second partition before the next commit: its ack should
    // never show up in a driver commit call.
    consumer
        .on_partitions_revoked(HashSet::from([dropped.clone()]))
        .await;

    consumer.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), run_handle).await;

    let commits = driver.commit_log();
    for commit in &commits {
        assert!(!commit.contains_key(&dropped), "revoked tp must never be committed");
    }
    assert!(commits.iter().any(|c| c.get(&kept) == Some(&0)));
}

#[tokio::test]
async fn commit_issued_from_inside_the_revoke_callback_still_lands_for_the_revoked_tp() {
    let kept = tp("orders", 0);
    let dropped = tp("orders", 1);
    let mut batch = HashMap::new();
    batch.insert(kept.clone(), vec![rec(kept.clone(), 0)]);
    batch.insert(dropped.clone(), vec![rec(dropped.clone(), 0)]);
    let driver = Arc::new(MockDriver::with_single_batch(batch));

    let acked_messages: Arc<std::sync::Mutex<Vec<Arc<Message>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = acked_messages.clone();
    let callback: stream_consumer_core::fetcher::RecordCallback = Arc::new(move |msg| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(msg);
        })
    });

    // The callback needs a handle to the consumer itself, so it is filled in
    // after construction (the callback closure only captures the slot).
    let consumer_slot: Arc<tokio::sync::OnceCell<Arc<stream_consumer_core::Consumer<MockDriver>>>> =
        Arc::new(tokio::sync::OnceCell::new());
    let slot_for_cb = consumer_slot.clone();
    let revoked_commit_result = Arc::new(std::sync::Mutex::new(None));
    let result_for_cb = revoked_commit_result.clone();

    let consumer = Consumer::new(
        driver.clone(),
        vec!["orders".into()],
        engine_config_no_drain(),
        ConsumerCallbacks {
            on_message: callback,
            on_rebalance_start: None,
            // Commits from inside the revoke callback, while the driver's
            // own assignment (not yet updated by a real rebalance) still
            // reports the revoked TP as owned.
            on_partitions_revoked: Some(Arc::new(move |_revoked| {
                let slot = slot_for_cb.clone();
                let result = result_for_cb.clone();
                Box::pin(async move {
                    let consumer = slot.get().expect("consumer set before first revoke");
                    let committed = consumer.commit(None).await;
                    *result.lock().unwrap() = Some(committed);
                })
            })),
            on_partitions_assigned: None,
            producer: None,
        },
    )
    .await
    .unwrap();
    consumer_slot.set(consumer.clone()).ok();

    let run_handle = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    for _ in 0..200 {
        if acked_messages.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let messages = acked_messages.lock().unwrap().clone();
    for m in &messages {
        consumer.ack(m).await;
    }

    consumer
        .on_partitions_revoked(HashSet::from([dropped.clone()]))
        .await;

    assert_eq!(
        *revoked_commit_result.lock().unwrap(),
        Some(true),
        "commit issued from inside the revoke callback must succeed"
    );
    let commits = driver.commit_log();
    assert!(commits.iter().any(|c| c.get(&dropped) == Some(&0)));
    assert!(commits.iter().any(|c| c.get(&kept) == Some(&0)));

    driver.set_assignment(HashSet::from([kept.clone()]));
    consumer.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), run_handle).await;
}

struct FailingProducer;

#[async_trait::async_trait]
impl AttachedProducer for FailingProducer {
    async fn wait_many(
        &self,
        tp: &TopicPartition,
        offset: i64,
        _futures: Vec<DeliveryFuture>,
    ) -> Result<(), ProducerFlushError> {
        Err(ProducerFlushError::Send {
            tp: tp.clone(),
            offset,
            source: rdkafka::error::KafkaError::Canceled,
        })
    }
}

#[tokio::test]
#[should_panic(expected = "producer flush failed before commit")]
async fn attached_producer_failure_crashes_instead_of_committing_past_it() {
    let t = tp("orders", 0);
    let mut batch = HashMap::new();
    batch.insert(t.clone(), vec![rec(t.clone(), 0)]);
    let driver = Arc::new(MockDriver::with_single_batch(batch));

    let acked_messages: Arc<std::sync::Mutex<Vec<Arc<Message>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = acked_messages.clone();
    let callback: stream_consumer_core::fetcher::RecordCallback = Arc::new(move |msg| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().unwrap().push(msg);
        })
    });

    let consumer = Consumer::new(
        driver,
        vec!["orders".into()],
        engine_config(),
        ConsumerCallbacks {
            on_message: callback,
            on_rebalance_start: None,
            on_partitions_revoked: None,
            on_partitions_assigned: None,
            producer: Some(Arc::new(FailingProducer)),
        },
    )
    .await
    .unwrap();

    tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    for _ in 0..200 {
        if acked_messages.lock().unwrap().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let message = acked_messages.lock().unwrap()[0].clone();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let _ = tx.send(Ok(()));
    consumer.attach_delivery(t, 0, rx).await;
    consumer.ack(&message).await;

    // Forces a commit, which must flush the (failing) attached delivery and
    // panic rather than silently commit past a lost producer write.
    consumer.stop().await;
}

#[tokio::test]
async fn thread_delegate_driver_round_trips_calls_to_the_blocking_inner_driver() {
    use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};
    use stream_consumer_core::driver::Driver;
    use stream_consumer_core::error::DriverError;
    use stream_consumer_core::thread_delegate::{BlockingDriver, ThreadDelegateDriver};

    struct Blocking;

    impl BlockingDriver for Blocking {
        fn fetch(
            &self,
            _active: &StdHashSet<TopicPartition>,
            _timeout: Duration,
        ) -> Result<StdHashMap<TopicPartition, Vec<Record>>, DriverError> {
            Ok(StdHashMap::new())
        }
        fn commit(&self, offsets: &StdHashMap<TopicPartition, i64>) -> Result<bool, DriverError> {
            Ok(!offsets.is_empty())
        }
        fn seek(&self, _tp: &TopicPartition, _offset: i64) -> Result<(), DriverError> {
            Ok(())
        }
        fn seek_to_committed(&self) -> Result<StdHashMap<TopicPartition, Option<i64>>, DriverError> {
            Ok(StdHashMap::new())
        }
        fn position(&self, _tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
            Ok(None)
        }
        fn assignment(&self) -> Result<StdHashSet<TopicPartition>, DriverError> {
            Ok(StdHashSet::from([tp("orders", 0)]))
        }
        fn highwater(&self, _tp: &TopicPartition) -> Result<i64, DriverError> {
            Ok(42)
        }
        fn earliest_offsets(
            &self,
            tps: &StdHashSet<TopicPartition>,
        ) -> Result<StdHashMap<TopicPartition, i64>, DriverError> {
            Ok(tps.iter().map(|tp| (tp.clone(), 0)).collect())
        }
        fn highwaters(
            &self,
            tps: &StdHashSet<TopicPartition>,
        ) -> Result<StdHashMap<TopicPartition, i64>, DriverError> {
            Ok(tps.iter().map(|tp| (tp.clone(), 42)).collect())
        }
        fn subscribe(&self, _topics: &[String]) -> Result<(), DriverError> {
            Ok(())
        }
        fn create_topic(&self, _topic: &str, _partitions: i32, _replication: i16) -> Result<(), DriverError> {
            Ok(())
        }
    }

    let driver = ThreadDelegateDriver::spawn(Blocking);
    let assignment = driver.assignment().await.unwrap();
    assert_eq!(assignment, StdHashSet::from([tp("orders", 0)]));

    let highwater = driver.highwater(&tp("orders", 0)).await.unwrap();
    assert_eq!(highwater, 42);

    let committed = driver
        .commit(&StdHashMap::from([(tp("orders", 0), 5)]))
        .await
        .unwrap();
    assert!(committed);

    drop(driver);
}
