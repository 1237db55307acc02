//! Competing writers and recovery of abandoned positions

mod common;

use common::{payloads, Group, SHORT, TIMEOUT};
use quorumlog::common::protocol::MessageKind;
use quorumlog::{Error, Position, ReplicaStatus};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_higher_ballot_supersedes_writer() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;

    let first = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_ok!(first.append(b"a".to_vec(), TIMEOUT).await);

    let second = assert_ok!(logs[1].writer(TIMEOUT, 3).await);
    let (b1, b2) = (first.ballot().await.unwrap(), second.ballot().await.unwrap());
    assert!(b1 < b2);
    assert_eq!(logs[0].replica().status().await, ReplicaStatus::Follower);
    assert_eq!(logs[1].replica().status().await, ReplicaStatus::Coordinator);

    let err = assert_err!(first.append(b"stale".to_vec(), TIMEOUT).await);
    assert!(matches!(err, Error::WriterFailed(_)));
    // The stale writer stays failed.
    let err = assert_err!(first.append(b"stale".to_vec(), TIMEOUT).await);
    assert!(matches!(err, Error::WriterFailed(_)));
    assert_eq!(first.ballot().await, None);

    assert_eq!(
        assert_ok!(second.append(b"b".to_vec(), TIMEOUT).await),
        Position::new(1)
    );
    let entries = assert_ok!(
        logs[2]
            .reader()
            .read(Position::new(0), Position::new(1), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![b"a".to_vec(), b"b".to_vec()]);
}

#[tokio::test]
async fn test_concurrent_elections() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;

    let (w1, w2) = tokio::join!(logs[0].writer(TIMEOUT, 3), logs[1].writer(TIMEOUT, 3));
    let mut writers = Vec::new();
    for writer in [w1, w2].into_iter().flatten() {
        if let Some(ballot) = writer.ballot().await {
            writers.push((ballot, writer));
        }
    }
    assert!(!writers.is_empty());
    writers.sort_by_key(|(ballot, _)| std::cmp::Reverse(*ballot));

    // Only the highest ballot can still append.
    let (_, winner) = &writers[0];
    assert_ok!(winner.append(b"winner".to_vec(), TIMEOUT).await);
    for (_, loser) in &writers[1..] {
        let err = assert_err!(loser.append(b"loser".to_vec(), TIMEOUT).await);
        assert!(matches!(err, Error::WriterFailed(_)));
    }
}

#[tokio::test]
async fn test_isolated_candidate_cannot_elect() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;

    group.cluster.isolate(1);
    let err = assert_err!(logs[0].writer(SHORT, 1).await);
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(logs[0].replica().status().await, ReplicaStatus::Follower);

    group.cluster.heal();
    assert_ok!(logs[0].writer(TIMEOUT, 1).await);
}

/// W1 stalls at position 2 after reaching only its own replica. W2 cannot
/// see that proposal and fills the slot with a no-op.
#[tokio::test]
async fn test_new_writer_fills_unconfirmed_position_with_nop() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;

    let w1 = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_eq!(assert_ok!(w1.append(b"x".to_vec(), TIMEOUT).await), Position::new(0));
    assert_eq!(assert_ok!(w1.append(b"y".to_vec(), TIMEOUT).await), Position::new(1));

    group.cluster.block(1, 2);
    group.cluster.block(1, 3);
    let err = assert_err!(w1.append(b"w".to_vec(), SHORT).await);
    assert!(matches!(err, Error::Timeout(_)));

    // W2's recovery queries for position 2 never reach A.
    group.cluster.block_kind(3, 1, MessageKind::Recover);
    let w2 = assert_ok!(logs[2].writer(TIMEOUT, 3).await);
    assert_eq!(assert_ok!(w2.append(b"z".to_vec(), TIMEOUT).await), Position::new(3));

    let action = assert_ok!(logs[1].replica().get(2).await);
    assert_eq!(action.kind, Some(quorumlog::common::ActionKind::Nop));
    assert!(action.learned);

    let entries = assert_ok!(
        logs[2]
            .reader()
            .read(Position::new(0), Position::new(3), TIMEOUT)
            .await
    );
    assert_eq!(
        payloads(&entries),
        vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]
    );
    assert_eq!(entries[2].position, Position::new(3));

    // W1 was superseded while stalled.
    let err = assert_err!(w1.append(b"late".to_vec(), SHORT).await);
    assert!(matches!(err, Error::WriterFailed(_)));
}

/// Same stall, but W2 hears from A during recovery and finishes W1's
/// proposal instead of discarding it.
#[tokio::test]
async fn test_new_writer_completes_stalled_proposal() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;

    let w1 = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_ok!(w1.append(b"x".to_vec(), TIMEOUT).await);
    assert_ok!(w1.append(b"y".to_vec(), TIMEOUT).await);

    group.cluster.block(1, 2);
    group.cluster.block(1, 3);
    assert_err!(w1.append(b"w".to_vec(), SHORT).await);

    let w2 = assert_ok!(logs[2].writer(TIMEOUT, 3).await);
    assert_eq!(assert_ok!(w2.append(b"z".to_vec(), TIMEOUT).await), Position::new(3));

    let entries = assert_ok!(
        logs[1]
            .reader()
            .read(Position::new(0), Position::new(3), TIMEOUT)
            .await
    );
    assert_eq!(
        payloads(&entries),
        vec![b"x".to_vec(), b"y".to_vec(), b"w".to_vec(), b"z".to_vec()]
    );
}
