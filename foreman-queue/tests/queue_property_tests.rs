//! Property-Based Tests for the In-Memory Stream Queue
//!
//! **Property 1: Monotonic ids.** Published message ids sort strictly after
//! every earlier id on the same stream.
//!
//! **Property 2: Order preservation.** A consumer group sees messages in
//! publish order regardless of how consumption is batched.
//!
//! **Property 3: Exactly-once group delivery until claim.** Consuming with
//! any batching never delivers a message to the same group twice while it is
//! pending.

use foreman_queue::{GroupStart, InMemoryStreamQueue, StreamQueue};
use proptest::prelude::*;
use serde_json::json;

fn run<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
        .block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_ids_strictly_increase(count in 1usize..200) {
        run(async move {
            let queue = InMemoryStreamQueue::new();
            let mut previous = String::new();
            for n in 0..count {
                let id = queue.publish("s", &json!({ "n": n })).await.unwrap();
                prop_assert!(id > previous);
                previous = id;
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_group_sees_publish_order(
        payloads in prop::collection::vec(0u64..1000, 1..50),
        batch_sizes in prop::collection::vec(1usize..7, 1..60),
    ) {
        run(async move {
            let queue = InMemoryStreamQueue::new();
            queue.ensure_group("s", "g", GroupStart::Beginning).await.unwrap();
            for value in &payloads {
                queue.publish("s", &json!({ "v": value })).await.unwrap();
            }

            let mut seen = Vec::new();
            let mut batches = batch_sizes.into_iter().cycle();
            while seen.len() < payloads.len() {
                let max = batches.next().unwrap();
                let batch = queue.consume("s", "g", "c0", max, 0).await.unwrap();
                prop_assert!(batch.len() <= max);
                for message in batch {
                    seen.push(message.payload["v"].as_u64().unwrap());
                }
            }
            prop_assert_eq!(seen, payloads);
            Ok(())
        })?;
    }

    #[test]
    fn prop_no_double_delivery_while_pending(
        count in 1usize..40,
        extra_polls in 1usize..5,
    ) {
        run(async move {
            let queue = InMemoryStreamQueue::new();
            queue.ensure_group("s", "g", GroupStart::Beginning).await.unwrap();
            for n in 0..count {
                queue.publish("s", &json!({ "n": n })).await.unwrap();
            }

            let mut delivered = 0usize;
            for _ in 0..(count + extra_polls) {
                delivered += queue.consume("s", "g", "c0", 3, 0).await.unwrap().len();
            }
            prop_assert_eq!(delivered, count);
            prop_assert_eq!(queue.pending("s", "g").await.unwrap().len(), count);
            Ok(())
        })?;
    }
}
