//! Event channel integration tests
//!
//! Exercises the bridge between a blocking publisher thread and an async
//! consumer, the way the scan worker and the monitor use it.
//!
//! Run with: `cargo test -p common --test event_channel_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{DeviceCandidate, DeviceIdentity, DeviceKey, RegistryEvent, create_event_channel};
use std::thread;
use std::time::Duration;

fn identity(serial_number: u64) -> DeviceIdentity {
    let candidate = DeviceCandidate {
        key: DeviceKey::new(1, 7),
        vendor_id: 0x1209,
        product_id: 0x0d32,
        description: "ODrive".to_string(),
    };
    DeviceIdentity::new(&candidate, serial_number)
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (sink, stream) = create_event_channel();

    let publisher = thread::spawn(move || {
        sink.publish(RegistryEvent::Connected {
            slot: 0,
            identity: identity(1),
        });
        sink.publish(RegistryEvent::Disconnected {
            slot: 0,
            serial_number: 1,
        });
        sink.publish(RegistryEvent::Reconnected {
            slot: 0,
            identity: identity(1),
        });
    });

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, stream.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        received.push(event);
    }
    publisher.join().unwrap();

    assert!(matches!(received[0], RegistryEvent::Connected { slot: 0, .. }));
    assert!(matches!(
        received[1],
        RegistryEvent::Disconnected {
            slot: 0,
            serial_number: 1
        }
    ));
    assert!(matches!(received[2], RegistryEvent::Reconnected { slot: 0, .. }));
}

#[tokio::test]
async fn test_recv_fails_once_sink_dropped() {
    let (sink, stream) = create_event_channel();
    sink.publish(RegistryEvent::Rejected {
        key: DeviceKey::new(2, 3),
        reason: "no free slot".to_string(),
    });
    drop(sink);

    assert!(stream.recv().await.is_ok());
    assert!(stream.recv().await.is_err());
}

#[tokio::test]
async fn test_slow_consumer_does_not_block_publisher() {
    let (sink, stream) = create_event_channel();

    let publisher = thread::spawn(move || {
        for slot in 0..1000 {
            sink.publish(RegistryEvent::Disconnected {
                slot,
                serial_number: slot as u64,
            });
        }
    });

    // The publisher finishes even though nobody reads yet
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while !publisher.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("publisher blocked");

    assert_eq!(stream.drain().len(), common::channel::EVENT_CHANNEL_CAPACITY);
}
