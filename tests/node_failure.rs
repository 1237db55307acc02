//! Replica failures and timeouts seen by a writer

mod common;

use common::{payloads, Group, SHORT, TIMEOUT};
use quorumlog::{Error, Position, ReplicaStatus};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_minority_failure_tolerated() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);

    group.cluster.remove(2);
    let position = assert_ok!(writer.append(b"one down".to_vec(), TIMEOUT).await);
    assert_eq!(group.holders(position.value(), b"one down").await, 2);

    let entries = assert_ok!(logs[2].reader().read(position, position, TIMEOUT).await);
    assert_eq!(payloads(&entries), vec![b"one down".to_vec()]);
}

#[tokio::test]
async fn test_timeout_keeps_writer_usable() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_ok!(writer.append(b"a".to_vec(), TIMEOUT).await);

    group.cluster.isolate(1);
    let err = assert_err!(writer.append(b"b".to_vec(), SHORT).await);
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_retryable());

    // Still partitioned: the timed-out proposal cannot finish either.
    let err = assert_err!(writer.append(b"c".to_vec(), SHORT).await);
    assert!(matches!(err, Error::Timeout(_)));

    // Once healed the pending proposal keeps its position.
    group.cluster.heal();
    assert_eq!(
        assert_ok!(writer.append(b"c".to_vec(), TIMEOUT).await),
        Position::new(2)
    );

    let entries = assert_ok!(
        logs[1]
            .reader()
            .read(Position::new(0), Position::new(2), TIMEOUT)
            .await
    );
    assert_eq!(
        payloads(&entries),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[tokio::test]
async fn test_quorum_loss_times_out_reads() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_ok!(writer.append(b"a".to_vec(), TIMEOUT).await);

    group.cluster.remove(2);
    group.cluster.remove(3);

    let err = assert_err!(
        logs[0]
            .reader()
            .read(Position::new(0), Position::new(0), SHORT)
            .await
    );
    assert!(matches!(err, Error::Timeout(_)));

    // Local bounds need no quorum.
    assert_eq!(assert_ok!(logs[0].reader().ending().await), Position::new(0));
}

#[tokio::test]
async fn test_uncommitted_position_fails_read() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_ok!(writer.append(b"a".to_vec(), TIMEOUT).await);

    // Only A stores the proposal at position 1.
    group.cluster.block(1, 2);
    group.cluster.block(1, 3);
    assert_err!(writer.append(b"pending".to_vec(), SHORT).await);
    group.cluster.heal();

    let err = assert_err!(
        logs[1]
            .reader()
            .read(Position::new(0), Position::new(1), TIMEOUT)
            .await
    );
    assert!(matches!(err, Error::OperationFailed(_)));

    // Committed prefix is still readable.
    let entries = assert_ok!(
        logs[1]
            .reader()
            .read(Position::new(0), Position::new(0), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![b"a".to_vec()]);
}

#[tokio::test]
async fn test_replica_fills_gap_on_its_own() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);

    group.cluster.isolate(3);
    assert_ok!(writer.append(b"a".to_vec(), TIMEOUT).await);
    assert_ok!(writer.append(b"b".to_vec(), TIMEOUT).await);
    group.cluster.heal();

    // The write at position 2 shows replica 3 what it missed.
    assert_ok!(writer.append(b"c".to_vec(), TIMEOUT).await);

    let replica = logs[2].replica().clone();
    assert_ok!(
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if replica.status().await == ReplicaStatus::Follower
                    && replica.missing(2).await.is_empty()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    );
    assert_eq!(
        replica.get(0).await.unwrap().kind,
        Some(quorumlog::common::ActionKind::Append(b"a".to_vec()))
    );

    // Back in the quorum: losing another member leaves the group writable.
    group.cluster.remove(2);
    assert_eq!(
        assert_ok!(writer.append(b"d".to_vec(), TIMEOUT).await),
        Position::new(3)
    );
}
