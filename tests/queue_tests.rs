use std::time::Duration;

use uuid::Uuid;

use runbox::config::QueueConfig;
use runbox::error::RunboxError;
use runbox::queue::QueueService;

fn short_visibility(ms: u64) -> QueueService {
    QueueService::new(QueueConfig {
        visibility_timeout: Duration::from_millis(ms),
        ..QueueConfig::default()
    })
}

#[tokio::test]
async fn test_depth_counts_follow_enqueue_and_dequeue() {
    let queue = QueueService::default();
    for _ in 0..5 {
        assert!(queue.enqueue(Uuid::new_v4()).await.unwrap());
    }
    queue.dequeue().await.unwrap();
    queue.dequeue().await.unwrap();

    assert_eq!(queue.queue_length().await, 3);
    assert_eq!(queue.processing_count().await, 2);

    let stats = queue.stats().await;
    assert_eq!(stats.enqueued_total, 5);
    assert_eq!(stats.dequeued_total, 2);
}

#[tokio::test]
async fn test_dequeue_is_fifo() {
    let queue = QueueService::default();
    let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        queue.enqueue(*id).await.unwrap();
    }
    for id in &ids {
        assert_eq!(queue.dequeue().await, Some(*id));
    }
    assert_eq!(queue.dequeue().await, None);
}

#[tokio::test]
async fn test_enqueue_ignores_duplicates() {
    let queue = QueueService::default();
    let id = Uuid::new_v4();
    assert!(queue.enqueue(id).await.unwrap());
    assert!(!queue.enqueue(id).await.unwrap());

    queue.dequeue().await.unwrap();
    assert!(!queue.enqueue(id).await.unwrap());
    assert_eq!(queue.queue_length().await, 0);
}

#[tokio::test]
async fn test_enqueue_fails_at_capacity() {
    let queue = QueueService::new(QueueConfig {
        max_length: 2,
        ..QueueConfig::default()
    });
    queue.enqueue(Uuid::new_v4()).await.unwrap();
    queue.enqueue(Uuid::new_v4()).await.unwrap();

    let err = queue.enqueue(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, RunboxError::Queue(_)));
}

#[tokio::test]
async fn test_complete_processing_is_idempotent() {
    let queue = QueueService::default();
    let id = Uuid::new_v4();
    queue.enqueue(id).await.unwrap();
    queue.dequeue().await.unwrap();

    assert!(queue.complete_processing(id).await);
    assert!(!queue.complete_processing(id).await);
    assert_eq!(queue.processing_count().await, 0);
    assert_eq!(queue.stats().await.completed_total, 1);
}

#[tokio::test]
async fn test_complete_processing_of_unknown_id_is_noop() {
    let queue = QueueService::default();
    assert!(!queue.complete_processing(Uuid::new_v4()).await);
}

#[tokio::test]
async fn test_remove_only_affects_waiting_ids() {
    let queue = QueueService::default();
    let waiting = Uuid::new_v4();
    let running = Uuid::new_v4();
    queue.enqueue(running).await.unwrap();
    queue.enqueue(waiting).await.unwrap();
    queue.dequeue().await.unwrap();

    assert!(queue.remove(waiting).await);
    assert!(!queue.remove(waiting).await);
    assert!(!queue.remove(running).await);
    assert!(queue.is_processing(running).await);
}

#[tokio::test]
async fn test_peek_does_not_dequeue() {
    let queue = QueueService::default();
    let first = Uuid::new_v4();
    queue.enqueue(first).await.unwrap();
    queue.enqueue(Uuid::new_v4()).await.unwrap();

    assert_eq!(queue.peek(1).await, vec![first]);
    assert_eq!(queue.peek(10).await.len(), 2);
    assert_eq!(queue.queue_length().await, 2);
}

#[tokio::test]
async fn test_expired_items_return_to_head() {
    let queue = short_visibility(30);
    let stuck = Uuid::new_v4();
    let waiting = Uuid::new_v4();
    queue.enqueue(stuck).await.unwrap();
    queue.dequeue().await.unwrap();
    queue.enqueue(waiting).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(queue.reclaim_expired().await, vec![stuck]);

    assert_eq!(queue.processing_count().await, 0);
    assert_eq!(queue.dequeue().await, Some(stuck));
    assert_eq!(queue.stats().await.redelivered_total, 1);
}

#[tokio::test]
async fn test_reclaim_keeps_items_within_visibility_timeout() {
    let queue = QueueService::default();
    let id = Uuid::new_v4();
    queue.enqueue(id).await.unwrap();
    queue.dequeue().await.unwrap();

    assert!(queue.reclaim_expired().await.is_empty());
    assert!(queue.is_processing(id).await);
}

#[tokio::test]
async fn test_clear_empties_both_sets() {
    let queue = QueueService::default();
    for _ in 0..3 {
        queue.enqueue(Uuid::new_v4()).await.unwrap();
    }
    queue.dequeue().await.unwrap();

    assert_eq!(queue.clear().await, 3);
    assert_eq!(queue.queue_length().await, 0);
    assert_eq!(queue.processing_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_dequeue_hands_out_each_id_once() {
    let queue = std::sync::Arc::new(QueueService::default());
    for _ in 0..100 {
        queue.enqueue(Uuid::new_v4()).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let Some(id) = queue.dequeue().await {
                taken.push(id);
            }
            taken
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 100);
}
