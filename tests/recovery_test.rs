//! Long-running fault behavior: the logger never stops and never touches
//! stale handles.

use std::time::Duration;

use flight_logger::indicator::NoopIndicator;
use flight_logger::pipeline::{ChunkOutcome, LoggerSession, SessionOptions};
use flight_logger::recovery::{RecoveryState, RetryPolicy};
use flight_logger::storage::MockCard;
use flight_logger::{StorageErrorKind, StorageOp};

const LOG: &str = "data.txt";

fn options(retry: RetryPolicy) -> SessionOptions {
    SessionOptions {
        retry,
        ..SessionOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn absent_card_retries_forever_and_drains_source() {
    let card = MockCard::new();
    card.remove();
    let mut session = LoggerSession::start(
        card.clone(),
        options(RetryPolicy {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..RetryPolicy::default()
        }),
        NoopIndicator,
    );
    assert_eq!(session.state(), RecoveryState::Fault);

    let data = vec![b'#'; 64 * 1024];
    let mut source: &[u8] = &data;
    let summary = session
        .run_until(&mut source, |stats| stats.idle_reads > 0)
        .await;

    assert_eq!(summary.stats.chunks_read, 512);
    assert_eq!(summary.stats.chunks_dropped, 512);
    assert_eq!(summary.stats.bytes_dropped, data.len() as u64);
    assert_eq!(summary.stats.chunks_written, 0);
    assert_eq!(summary.state, RecoveryState::Fault);

    // one attempt per chunk, every one failed
    assert_eq!(summary.recovery.attempts, 512);
    assert_eq!(summary.recovery.failed_attempts, 512);
    assert_eq!(summary.recovery.consecutive_failures, 512);
    assert_eq!(summary.recovery.faults, 1);
    assert_eq!(
        summary.recovery.last_error.as_ref().map(|e| e.kind),
        Some(StorageErrorKind::DeviceAbsent)
    );
    assert_eq!(card.open_handles(), 0);
    assert_eq!(card.counters().invalid_handle_ops, 0);

    card.insert();
    session.process_chunk(b"back").await;
    assert_eq!(session.state(), RecoveryState::Healthy);
    assert_eq!(
        session.process_chunk(b"ok\n").await,
        ChunkOutcome::Written { synced: false }
    );
    assert_eq!(card.contents(LOG).unwrap(), b"ok\n");
}

#[tokio::test(start_paused = true)]
async fn backoff_limits_attempts_while_card_is_out() {
    let card = MockCard::new();
    card.remove();
    let mut session = LoggerSession::start(
        card.clone(),
        options(RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            ..RetryPolicy::default()
        }),
        NoopIndicator,
    );

    // one chunk every 10ms for 5 seconds
    for _ in 0..500 {
        session.process_chunk(b"telemetry").await;
        tokio::time::advance(Duration::from_millis(10)).await;

        if let Some(until) = session.recovery().hold_until() {
            let remaining = until.saturating_duration_since(tokio::time::Instant::now());
            assert!(remaining <= Duration::from_millis(800));
        }
    }

    let stats = session.recovery().stats();
    assert_eq!(session.stats().chunks_dropped, 500);
    assert!(stats.attempts >= 5, "attempts: {}", stats.attempts);
    assert!(stats.attempts < 50, "attempts: {}", stats.attempts);
    assert_eq!(card.counters().mounts, stats.attempts + 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_burst_cools_down_then_resumes() {
    let card = MockCard::new();
    card.fail_always(StorageOp::Mount, StorageErrorKind::Io);
    let mut session = LoggerSession::start(
        card.clone(),
        options(RetryPolicy {
            max_attempts: Some(3),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            cooldown: Duration::from_secs(30),
            ..RetryPolicy::default()
        }),
        NoopIndicator,
    );

    for _ in 0..10 {
        session.process_chunk(b"x").await;
    }
    let stats = session.recovery().stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.cooldowns, 1);

    card.clear_faults();
    tokio::time::advance(Duration::from_secs(30)).await;
    session.process_chunk(b"x").await;
    assert_eq!(session.state(), RecoveryState::Healthy);
    assert_eq!(session.recovery().stats().recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn unformatted_card_is_reported_then_recovered() {
    let card = MockCard::new();
    card.set_formatted(false);
    let mut session = LoggerSession::start(card.clone(), SessionOptions::default(), NoopIndicator);
    assert_eq!(
        session
            .recovery()
            .stats()
            .last_error
            .as_ref()
            .map(|e| e.kind),
        Some(StorageErrorKind::FilesystemUnrecognized)
    );

    card.set_formatted(true);
    session.process_chunk(b"x").await;
    assert_eq!(session.state(), RecoveryState::Healthy);
}

#[tokio::test(start_paused = true)]
async fn short_write_faults_and_reopens_at_true_end() {
    let card = MockCard::new();
    let mut session = LoggerSession::start(card.clone(), SessionOptions::default(), NoopIndicator);
    session.process_chunk(b"0123").await;

    card.fail_next(StorageOp::Write, 1, StorageErrorKind::ShortWrite);
    assert_eq!(session.process_chunk(b"abcdef").await, ChunkOutcome::Dropped);
    assert_eq!(
        session
            .recovery()
            .stats()
            .last_error
            .as_ref()
            .map(|e| e.kind),
        Some(StorageErrorKind::ShortWrite)
    );

    // the accepted half was rolled back, so the reopen lands where the
    // failed write started
    assert_eq!(card.contents(LOG).unwrap(), b"0123");
    session.process_chunk(b"-").await;
    assert_eq!(session.state(), RecoveryState::Healthy);
    assert_eq!(session.file_offset(), Some(4));

    session.process_chunk(b"!").await;
    assert_eq!(card.contents(LOG).unwrap(), b"0123!");
}

#[tokio::test(start_paused = true)]
async fn repeated_faults_never_reuse_invalidated_handles() {
    let card = MockCard::new();
    let mut session = LoggerSession::start(card.clone(), SessionOptions::default(), NoopIndicator);

    for round in 0..20 {
        session.process_chunk(b"data").await;
        match round % 3 {
            0 => card.fail_next(StorageOp::Write, 1, StorageErrorKind::Io),
            1 => card.fail_next(StorageOp::Open, 1, StorageErrorKind::Io),
            _ => card.remove(),
        }
        session.process_chunk(b"data").await;
        card.insert();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            session.process_chunk(b"data").await;
        }
    }

    assert_eq!(card.counters().invalid_handle_ops, 0);
    assert!(card.open_handles() <= 1);
}
