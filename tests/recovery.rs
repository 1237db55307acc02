//! Restarts, truncation and on-disk recovery

mod common;

use common::{payloads, Group, SHORT, TIMEOUT};
use quorumlog::common::protocol::MessageKind;
use quorumlog::ops::{compact_replica, verify_replica};
use quorumlog::{Error, Position, ReplicaStatus, MAX_PAYLOAD_LEN};
use std::io::Write;
use tokio_test::{assert_err, assert_ok};

async fn fill(group: &Group, count: u8) -> Vec<quorumlog::Log> {
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    for i in 0..count {
        assert_ok!(writer.append(vec![b'a' + i], TIMEOUT).await);
    }
    logs
}

async fn close_all(logs: Vec<quorumlog::Log>) {
    for log in logs {
        assert_ok!(log.close().await);
    }
}

#[tokio::test]
async fn test_group_restart_keeps_log() {
    let group = Group::new(3, 2);
    let logs = fill(&group, 3).await;
    close_all(logs).await;

    let group = group.restart();
    let logs = group.open_all().await;
    for log in &logs {
        assert_eq!(log.replica().status().await, ReplicaStatus::Follower);
    }

    let entries = assert_ok!(
        logs[2]
            .reader()
            .read(Position::new(0), Position::new(2), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    // A new writer outranks the persisted promises and continues the log.
    let writer = assert_ok!(logs[1].writer(TIMEOUT, 3).await);
    assert_eq!(
        assert_ok!(writer.append(b"d".to_vec(), TIMEOUT).await),
        Position::new(3)
    );
}

#[tokio::test]
async fn test_truncate_survives_restart() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    for i in 0..5u8 {
        assert_ok!(writer.append(vec![i], TIMEOUT).await);
    }

    let beginning = assert_ok!(writer.truncate(Position::new(3), TIMEOUT).await);
    assert_eq!(beginning, Position::new(3));
    for log in &logs {
        assert_eq!(assert_ok!(log.reader().beginning().await), Position::new(3));
    }

    let err = assert_err!(
        logs[1]
            .reader()
            .read(Position::new(0), Position::new(4), TIMEOUT)
            .await
    );
    assert!(matches!(err, Error::OperationFailed(_)));

    // The truncation marker itself occupies position 5 and reads as nothing.
    let entries = assert_ok!(
        logs[1]
            .reader()
            .read(Position::new(3), Position::new(5), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![vec![3u8], vec![4u8]]);

    drop(writer);
    close_all(logs).await;
    let group = group.restart();
    let logs = group.open_all().await;

    assert_eq!(assert_ok!(logs[2].reader().beginning().await), Position::new(3));
    let err = assert_err!(
        logs[2]
            .reader()
            .read(Position::new(0), Position::new(4), TIMEOUT)
            .await
    );
    assert!(matches!(err, Error::OperationFailed(_)));

    let writer = assert_ok!(logs[2].writer(TIMEOUT, 3).await);
    assert_eq!(
        assert_ok!(writer.append(b"after".to_vec(), TIMEOUT).await),
        Position::new(6)
    );
}

#[tokio::test]
async fn test_truncate_past_end_keeps_writer() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_ok!(writer.append(b"a".to_vec(), TIMEOUT).await);

    let err = assert_err!(writer.truncate(Position::new(100), TIMEOUT).await);
    assert!(matches!(err, Error::OperationFailed(_)));
    assert!(writer.ballot().await.is_some());

    // Nothing was proposed for the rejected call.
    assert_eq!(
        assert_ok!(writer.append(b"b".to_vec(), TIMEOUT).await),
        Position::new(1)
    );
    assert_eq!(assert_ok!(logs[0].reader().beginning().await), Position::new(0));
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);

    let err = assert_err!(writer.append(vec![0u8; MAX_PAYLOAD_LEN + 1], TIMEOUT).await);
    assert!(matches!(err, Error::OperationFailed(_)));
    assert!(!err.is_retryable());
    assert!(writer.ballot().await.is_some());

    assert_eq!(
        assert_ok!(writer.append(b"ok".to_vec(), TIMEOUT).await),
        Position::new(0)
    );
}

#[tokio::test]
async fn test_truncate_waits_for_quorum_to_learn() {
    let group = Group::new(3, 2);
    let logs = fill(&group, 3).await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);

    // Peers accept the truncation but never hear that it committed.
    group.cluster.block_kind(1, 2, MessageKind::Learned);
    group.cluster.block_kind(1, 3, MessageKind::Learned);
    let err = assert_err!(writer.truncate(Position::new(2), SHORT).await);
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(logs[1].replica().beginning().await, 0);

    group.cluster.heal();
    assert_eq!(
        assert_ok!(writer.append(b"d".to_vec(), TIMEOUT).await),
        Position::new(4)
    );

    // Losing the writer's replica must not bring truncated entries back.
    group.cluster.remove(1);
    let err = assert_err!(
        logs[1]
            .reader()
            .read(Position::new(0), Position::new(1), TIMEOUT)
            .await
    );
    assert!(matches!(err, Error::OperationFailed(_)));

    let entries = assert_ok!(
        logs[2]
            .reader()
            .read(Position::new(2), Position::new(4), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![b"c".to_vec(), b"d".to_vec()]);
}

#[tokio::test]
async fn test_handles_fail_after_close() {
    let group = Group::new(3, 2);
    let mut logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    let reader = logs[0].reader();
    assert_ok!(writer.append(b"a".to_vec(), TIMEOUT).await);

    let log = logs.remove(0);
    assert_ok!(log.close().await);

    let err = assert_err!(writer.append(b"b".to_vec(), TIMEOUT).await);
    assert!(matches!(err, Error::LogClosed));
    let err = assert_err!(
        reader
            .read(Position::new(0), Position::new(0), TIMEOUT)
            .await
    );
    assert!(matches!(err, Error::LogClosed));
    assert!(matches!(reader.ending().await, Err(Error::LogClosed)));

    // The rest of the group is unaffected.
    let entries = assert_ok!(
        logs[0]
            .reader()
            .read(Position::new(0), Position::new(0), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![b"a".to_vec()]);
}

#[tokio::test]
async fn test_torn_tail_recovered_on_restart() {
    let group = Group::new(3, 2);
    let logs = fill(&group, 2).await;
    close_all(logs).await;

    let dir = group.data_dir("replica-1");
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.join("replica.log"))
            .unwrap();
        file.write_all(b"QLOG\x40\x00\x00\x00partial").unwrap();
    }
    let report = assert_ok!(verify_replica(&dir));
    assert!(!report.is_healthy());
    assert!(report.corrupt_bytes() > 0);

    let group = group.restart();
    let logs = group.open_all().await;
    assert!(assert_ok!(verify_replica(&dir)).is_healthy());

    let replica = logs[0].replica();
    assert_eq!(replica.ending().await, Some(1));
    assert!(replica.missing(1).await.is_empty());

    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    assert_eq!(
        assert_ok!(writer.append(b"c".to_vec(), TIMEOUT).await),
        Position::new(2)
    );
}

#[tokio::test]
async fn test_compaction_keeps_committed_state() {
    let group = Group::new(3, 2);
    let logs = group.open_all().await;
    let writer = assert_ok!(logs[0].writer(TIMEOUT, 3).await);
    for i in 0..6u8 {
        assert_ok!(writer.append(vec![i], TIMEOUT).await);
    }
    assert_ok!(writer.truncate(Position::new(4), TIMEOUT).await);
    drop(writer);
    close_all(logs).await;

    for id in &group.members {
        let report = assert_ok!(compact_replica(group.data_dir(&format!("replica-{}", id))));
        assert!(report.records_dropped > 0);
        assert!(report.bytes_freed() > 0);
    }

    let group = group.restart();
    let logs = group.open_all().await;
    let entries = assert_ok!(
        logs[1]
            .reader()
            .read(Position::new(4), Position::new(5), TIMEOUT)
            .await
    );
    assert_eq!(payloads(&entries), vec![vec![4u8], vec![5u8]]);
    assert_eq!(assert_ok!(logs[1].reader().beginning().await), Position::new(4));
}
