use crate::helpers;
use letterbox::publishers::{DeliveryMode, Envelope, Letter, Notifications, PublishError};
use letterbox::topology::Topologer;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;

const COLLECT_DEADLINE: Duration = Duration::from_secs(120);

fn test_letter(letter_id: u64, queue: &str) -> Letter {
    Letter {
        letter_id,
        retry_count: 3,
        body: vec![0xFF, 0xFF, 0x89, 0xFF, 0xFF],
        envelope: Envelope {
            exchange: String::new(),
            routing_key: queue.into(),
            content_type: "plain/text".into(),
            mandatory: false,
            immediate: false,
            delivery_mode: DeliveryMode::Persistent,
        },
    }
}

/// Read notifications until `expected` letters are accounted for, failing
/// the test if the stream dries up or the deadline passes.
async fn collect(
    notifications: &mut Notifications,
    expected: u64,
) -> (u64, u64, HashSet<u64>) {
    timeout(COLLECT_DEADLINE, async {
        let mut success = 0u64;
        let mut failure = 0u64;
        let mut seen = HashSet::new();
        while success + failure < expected {
            let notification = notifications
                .recv()
                .await
                .expect("notification stream ended early");
            assert!(
                seen.insert(notification.letter_id),
                "letter {} was notified twice",
                notification.letter_id
            );
            if notification.success {
                success += 1;
            } else {
                failure += 1;
            }
        }
        (success, failure, seen)
    })
    .await
    .expect("timed out waiting for notifications")
}

#[tokio::test]
async fn publishing_a_single_letter_notifies_success() {
    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let queue = helpers::unique_name("TestQueue");
    topologer.declare_durable_queue(&queue).await.unwrap();

    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());

    // Act
    publisher.publish(test_letter(1, &queue)).await;

    // Assert
    let notification = notifications.recv().await.unwrap();
    assert!(notification.success);
    assert_eq!(notification.letter_id, 1);
    assert!(notification.error.is_none());
    assert!(notification.failed_letter.is_none());

    topologer.delete_queue(&queue).await.unwrap();
    channel_pool.shutdown().await;
}

#[tokio::test]
async fn publishing_with_confirmation_notifies_the_broker_disposition() {
    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let queue = helpers::unique_name("ConfirmationTestQueue");
    topologer.declare_durable_queue(&queue).await.unwrap();

    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());

    // Act
    publisher.publish_with_confirmation(test_letter(1, &queue)).await;

    // Assert
    let notification = notifications.recv().await.unwrap();
    assert!(notification.success);
    assert_eq!(notification.letter_id, 1);

    topologer.delete_queue(&queue).await.unwrap();
    channel_pool.shutdown().await;
}

#[tokio::test]
async fn unroutable_mandatory_publishes_hand_the_letter_back() {
    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());

    let mut letter = test_letter(7, &helpers::unique_name("NoSuchQueue"));
    letter.envelope.mandatory = true;

    // Act
    publisher.publish_with_confirmation(letter).await;

    // Assert
    let notification = notifications.recv().await.unwrap();
    assert!(!notification.success);
    assert_eq!(notification.letter_id, 7);
    assert!(matches!(
        notification.error,
        Some(PublishError::Unroutable(_))
    ));
    let handed_back = notification.failed_letter.expect("letter should travel back");
    assert_eq!(handed_back.letter_id, 7);

    channel_pool.shutdown().await;
}

#[tokio::test]
async fn auto_publishing_accounts_for_every_letter_exactly_once() {
    const MESSAGE_COUNT: u64 = 20_000;

    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let prefix = helpers::unique_name("PubTQ");
    let queues: Vec<String> = (0..10).map(|i| format!("{prefix}-{i}")).collect();
    for queue in &queues {
        topologer.declare_durable_queue(queue).await.unwrap();
    }

    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());
    publisher.start_auto_publish();

    // Act: one producer task fans letters out round-robin over the queues.
    let producer = {
        let publisher = publisher.clone();
        let queues = queues.clone();
        tokio::spawn(async move {
            for i in 0..MESSAGE_COUNT {
                let queue = &queues[(i % 10) as usize];
                publisher
                    .queue_letter(test_letter(i, queue))
                    .await
                    .expect("queueing failed while auto-publish was running");
            }
        })
    };

    // Assert
    let (success, failure, seen) = collect(&mut notifications, MESSAGE_COUNT).await;
    assert_eq!(success + failure, MESSAGE_COUNT);
    assert_eq!(seen.len(), MESSAGE_COUNT as usize);
    assert!((0..MESSAGE_COUNT).all(|id| seen.contains(&id)));

    producer.await.unwrap();
    publisher.stop_auto_publish().await;
    for queue in &queues {
        topologer.delete_queue(queue).await.unwrap();
    }
    channel_pool.shutdown().await;
}

#[tokio::test]
async fn two_publishers_share_one_channel_pool() {
    publishers_share_one_channel_pool(2, 5_000).await;
}

#[tokio::test]
async fn four_publishers_share_one_channel_pool() {
    publishers_share_one_channel_pool(4, 2_500).await;
}

async fn publishers_share_one_channel_pool(publisher_count: usize, letters_each: u64) {
    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let queue = helpers::unique_name("PubTQ");
    topologer.declare_durable_queue(&queue).await.unwrap();

    let mut producers = Vec::new();
    let mut collectors = Vec::new();
    for _ in 0..publisher_count {
        let (publisher, mut notifications) =
            helpers::get_publisher(&seasoning, channel_pool.clone());
        publisher.start_auto_publish();

        let queue = queue.clone();
        let feeder = publisher.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..letters_each {
                feeder.queue_letter(test_letter(i, &queue)).await.unwrap();
            }
            feeder
        }));
        collectors.push(tokio::spawn(async move {
            let (success, failure, _) = collect(&mut notifications, letters_each).await;
            success + failure
        }));
    }

    // Act / Assert: every publisher accounts for all of its letters.
    let mut accounted = 0u64;
    for collector in collectors {
        accounted += collector.await.unwrap();
    }
    assert_eq!(accounted, publisher_count as u64 * letters_each);

    for producer in producers {
        let publisher = producer.await.unwrap();
        publisher.stop_auto_publish().await;
    }
    topologer.delete_queue(&queue).await.unwrap();
    channel_pool.shutdown().await;
}

#[tokio::test]
async fn parallel_confirmation_publishes_notify_once_per_task() {
    const TASKS: u64 = 5_000;

    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let queue = helpers::unique_name("ConfirmationTestQueue");
    topologer.declare_durable_queue(&queue).await.unwrap();

    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());

    // Act: every publish runs on its own task, all against one publisher.
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..TASKS {
        let publisher = publisher.clone();
        let queue = queue.clone();
        tasks.spawn(async move {
            publisher.publish_with_confirmation(test_letter(i, &queue)).await;
        });
    }

    // Assert
    let (success, failure, seen) = collect(&mut notifications, TASKS).await;
    assert_eq!(success + failure, TASKS);
    assert_eq!(seen.len(), TASKS as usize);

    while tasks.join_next().await.is_some() {}
    publisher.shutdown().await;
    topologer.delete_queue(&queue).await.unwrap();
    channel_pool.shutdown().await;
}

#[tokio::test]
async fn confirmation_publish_racing_pool_shutdown_still_notifies() {
    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let queue = helpers::unique_name("ConfirmationTestQueue");
    topologer.declare_durable_queue(&queue).await.unwrap();

    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());

    // Act: shut the pool down while the publish is in flight.
    let racing = {
        let publisher = publisher.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            publisher.publish_with_confirmation(test_letter(1, &queue)).await;
        })
    };
    channel_pool.shutdown().await;
    racing.await.unwrap();

    // Assert: the outstanding publish still produced its notification -
    // either the ack raced in, or a failure carrying the letter.
    let notification = timeout(Duration::from_secs(30), notifications.recv())
        .await
        .expect("timed out waiting for the racing notification")
        .unwrap();
    assert_eq!(notification.letter_id, 1);
    assert!(notification.success || notification.failed_letter.is_some());
}

#[tokio::test]
async fn fire_and_forget_failures_can_be_resubmitted() {
    // Arrange
    let seasoning = helpers::get_seasoning();
    let channel_pool = helpers::get_channel_pool(&seasoning);
    let topologer = Topologer::new(channel_pool.clone());
    let queue = helpers::unique_name("TestQueue");
    topologer.declare_durable_queue(&queue).await.unwrap();

    let (publisher, mut notifications) = helpers::get_publisher(&seasoning, channel_pool.clone());

    // Act
    for i in 0..100u64 {
        publisher.publish(test_letter(i, &queue)).await;
    }

    // Assert: every failure hands the letter back, ready for an application
    // retry loop to resubmit it.
    let (mut success, mut failure) = (0u64, 0u64);
    while success + failure < 100 {
        let notification = timeout(Duration::from_secs(30), notifications.recv())
            .await
            .expect("timed out waiting for notifications")
            .unwrap();
        if notification.success {
            success += 1;
        } else {
            let letter = notification.failed_letter.expect("letter should travel back");
            publisher.publish(letter).await;
            failure += 1;
        }
    }
    assert_eq!(success + failure, 100);

    topologer.delete_queue(&queue).await.unwrap();
    channel_pool.shutdown().await;
}
