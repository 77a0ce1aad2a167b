use std::sync::Arc;
use std::time::Duration;

use polybus_broker::{Connection, ExchangeKind, QueueOptions};
use polybus_broker_memory::MemoryBroker;
use polybus_bus::{Error, EventBusOptions, EventPublisher};
use polybus_example::Person;
use tokio::time::timeout;

fn options() -> EventBusOptions {
    EventBusOptions {
        exchange: "bus".to_string(),
        queue: "people".to_string(),
        tag: "people-1".to_string(),
    }
}

async fn bind_queue(broker: &MemoryBroker) {
    let channel = broker.connection().create_channel().await.unwrap();
    channel
        .exchange_declare("bus", ExchangeKind::Fanout, true)
        .await
        .unwrap();
    channel
        .queue_declare("people", QueueOptions::quorum())
        .await
        .unwrap();
    channel.queue_bind("people", "bus", "").await.unwrap();
    channel.close().await.unwrap();
}

fn person(id: i32) -> Person {
    Person {
        id,
        name: format!("person {id}"),
        emails: vec![format!("{id}@example.com")],
        ..Person::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_are_all_confirmed() {
    let broker = MemoryBroker::new();
    bind_queue(&broker).await;
    let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|task| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    publisher.publish(&person(task * 100 + i)).await.unwrap();
                }
            })
        })
        .collect();

    for task in tasks {
        timeout(Duration::from_secs(5), task)
            .await
            .expect("publisher stalled")
            .unwrap();
    }

    assert_eq!(broker.queue_len("people"), 160);
    assert_eq!(broker.published_count("bus"), 160);
    assert!(publisher.outstanding().is_empty());

    // Every channel is back in the pool and none was shared.
    assert!(publisher.pooled_channels() <= 16);
    assert_eq!(broker.open_channels(), publisher.pooled_channels());

    publisher.shutdown().await;
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nacks_under_load_are_retried() {
    let broker = MemoryBroker::new();
    bind_queue(&broker).await;
    let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

    broker.nack_next_publishes(25);

    let tasks: Vec<_> = (0..5)
        .map(|task| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    publisher.publish(&person(task * 100 + i)).await.unwrap();
                }
            })
        })
        .collect();

    for task in tasks {
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    // Nacked attempts are never routed.
    assert_eq!(broker.queue_len("people"), 50);

    publisher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_background_publishers() {
    let broker = MemoryBroker::new();
    bind_queue(&broker).await;
    let publisher = EventPublisher::new(options(), broker.connection()).unwrap();

    let loops: Vec<_> = (0..4)
        .map(|id| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                let mut published = 0_u64;

                loop {
                    match publisher.publish(&person(id)).await {
                        Ok(()) => published += 1,
                        Err(Error::Disposed) => return published,
                        Err(error) => panic!("unexpected error: {error}"),
                    }
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(5), publisher.shutdown())
        .await
        .expect("shutdown stalled");

    let mut confirmed = 0;
    for publishing in loops {
        confirmed += timeout(Duration::from_secs(1), publishing)
            .await
            .expect("loop did not observe shutdown")
            .unwrap();
    }

    assert!(confirmed > 0);
    assert_eq!(broker.published_count("bus"), confirmed);
    assert_eq!(broker.queue_len("people"), usize::try_from(confirmed).unwrap());
    assert_eq!(broker.open_channels(), 0);
    assert!(publisher.outstanding().is_empty());
}

#[tokio::test]
async fn test_invalid_options() {
    let mut options = options();
    options.exchange = "x".repeat(256);

    let connection: Arc<dyn Connection> = MemoryBroker::new().connection();

    assert!(matches!(
        EventPublisher::new(options, connection),
        Err(Error::InvalidOptions(_))
    ));
}
