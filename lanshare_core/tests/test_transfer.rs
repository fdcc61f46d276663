//! End-to-end transfers over loopback between the sender and the receiving server.

mod common;

use common::*;
use lanshare_core::transfer::{AdaptiveConfig, spawn_send};
use lanshare_core::{AppEvent, Direction, TransferErrorKind, TransferOutcome};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_loopback_transfer_is_byte_identical() {
    init_logging();
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();

    // 1. Receiver
    let (recv_tx, mut recv_rx) = mpsc::channel::<AppEvent>(1000);
    let server = start_server(dst_dir.path(), recv_tx);

    // 2. Sender
    let data = test_data(5_000_000);
    let path = write_file(src_dir.path(), "report.pdf", &data);
    let (send_tx, mut send_rx) = mpsc::channel::<AppEvent>(1000);
    let handle = spawn_send(
        path,
        server.addr,
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    );
    let send_id = handle.id();

    let outcome = handle.wait().await;
    assert_eq!(
        outcome,
        TransferOutcome::Completed {
            file_name: "report.pdf".into()
        }
    );

    // 3. Sender events: started, progress ending at 100%, finished
    let (events, finished) = collect_until_finished(&mut send_rx, Direction::Sending).await;
    assert!(finished.is_success());
    match &events[0] {
        AppEvent::TransferStarted {
            session,
            file_name,
            total_bytes,
            ..
        } => {
            assert_eq!(*session, send_id);
            assert_eq!(file_name, "report.pdf");
            assert_eq!(*total_bytes, 5_000_000);
        }
        other => panic!("Expected TransferStarted first, got {:?}", other),
    }
    let progress = progress_of(&events, Direction::Sending);
    assert_eq!(progress.last(), Some(&(5_000_000, 5_000_000)));
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));

    // 4. Receiver side
    let (events, finished) = collect_until_finished(&mut recv_rx, Direction::Receiving).await;
    assert_eq!(
        finished,
        TransferOutcome::Completed {
            file_name: "report.pdf".into()
        }
    );
    let progress = progress_of(&events, Direction::Receiving);
    assert_eq!(progress.last(), Some(&(5_000_000, 5_000_000)));
    // Samples are throttled to one per 512 KiB
    assert!(progress.len() <= 11, "too many samples: {}", progress.len());

    let received = std::fs::read(dst_dir.path().join("report.pdf")).unwrap();
    assert_eq!(received.len(), data.len());
    assert!(received == data, "received content differs");

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_names_get_suffix() {
    init_logging();
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();

    let (recv_tx, mut recv_rx) = mpsc::channel::<AppEvent>(1000);
    let server = start_server(dst_dir.path(), recv_tx);
    let (send_tx, _send_rx) = mpsc::channel::<AppEvent>(1000);

    let path = write_file(src_dir.path(), "a.txt", b"hello");
    for expected in ["a.txt", "a_1.txt", "a_2.txt"] {
        let outcome = spawn_send(
            path.clone(),
            server.addr,
            AdaptiveConfig::default(),
            send_tx.clone(),
            CancellationToken::new(),
        )
        .wait()
        .await;
        assert!(outcome.is_success());

        let (_, finished) = collect_until_finished(&mut recv_rx, Direction::Receiving).await;
        assert_eq!(
            finished,
            TransferOutcome::Completed {
                file_name: expected.into()
            }
        );
    }

    assert_eq!(dir_entries(dst_dir.path()), ["a.txt", "a_1.txt", "a_2.txt"]);

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_empty_file() {
    init_logging();
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();

    let (recv_tx, mut recv_rx) = mpsc::channel::<AppEvent>(1000);
    let server = start_server(dst_dir.path(), recv_tx);
    let (send_tx, _send_rx) = mpsc::channel::<AppEvent>(1000);

    let path = write_file(src_dir.path(), "empty.log", b"");
    let outcome = spawn_send(
        path,
        server.addr,
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    )
    .wait()
    .await;
    assert!(outcome.is_success());

    let (events, finished) = collect_until_finished(&mut recv_rx, Direction::Receiving).await;
    assert!(finished.is_success());
    assert_eq!(progress_of(&events, Direction::Receiving), vec![(0u64, 0u64)]);
    assert_eq!(
        std::fs::metadata(dst_dir.path().join("empty.log"))
            .unwrap()
            .len(),
        0
    );

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_senders() {
    init_logging();
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();

    let (recv_tx, mut recv_rx) = mpsc::channel::<AppEvent>(1000);
    let server = start_server(dst_dir.path(), recv_tx);
    let (send_tx, _send_rx) = mpsc::channel::<AppEvent>(1000);

    let one = test_data(3_000_000);
    let two: Vec<u8> = test_data(2_000_000).into_iter().rev().collect();
    let path_one = write_file(src_dir.path(), "one.bin", &one);
    let path_two = write_file(src_dir.path(), "two.bin", &two);

    let h1 = spawn_send(
        path_one,
        server.addr,
        AdaptiveConfig::default(),
        send_tx.clone(),
        CancellationToken::new(),
    );
    let h2 = spawn_send(
        path_two,
        server.addr,
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    );
    assert_ne!(h1.id(), h2.id());

    let (o1, o2) = tokio::join!(h1.wait(), h2.wait());
    assert!(o1.is_success());
    assert!(o2.is_success());

    let mut finished = Vec::new();
    for _ in 0..2 {
        let (_, outcome) = collect_until_finished(&mut recv_rx, Direction::Receiving).await;
        finished.push(outcome);
    }
    assert!(finished.iter().all(TransferOutcome::is_success));

    assert_eq!(std::fs::read(dst_dir.path().join("one.bin")).unwrap(), one);
    assert_eq!(std::fs::read(dst_dir.path().join("two.bin")).unwrap(), two);

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_send_missing_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (send_tx, mut send_rx) = mpsc::channel::<AppEvent>(1000);

    let outcome = spawn_send(
        dir.path().join("does_not_exist.txt"),
        "127.0.0.1:9".parse().unwrap(),
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    )
    .wait()
    .await;

    match outcome {
        TransferOutcome::Failed { kind, .. } => assert_eq!(kind, TransferErrorKind::InvalidSource),
        other => panic!("Expected failure, got {:?}", other),
    }

    // Nothing started, exactly one finish
    let (events, _) = collect_until_finished(&mut send_rx, Direction::Sending).await;
    assert!(events.is_empty(), "unexpected events: {:?}", events);
}

#[tokio::test]
async fn test_send_directory_is_rejected() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (send_tx, _send_rx) = mpsc::channel::<AppEvent>(1000);

    let outcome = spawn_send(
        dir.path().to_path_buf(),
        "127.0.0.1:9".parse().unwrap(),
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    )
    .wait()
    .await;

    assert!(matches!(
        outcome,
        TransferOutcome::Failed {
            kind: TransferErrorKind::InvalidSource,
            ..
        }
    ));
}

#[tokio::test]
async fn test_connect_refused() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "note.txt", b"unsent");

    // Reserve a port, then free it so nothing listens there
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (send_tx, mut send_rx) = mpsc::channel::<AppEvent>(1000);
    let outcome = spawn_send(
        path,
        addr,
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    )
    .wait()
    .await;

    assert!(!outcome.is_success());
    let (events, _) = collect_until_finished(&mut send_rx, Direction::Sending).await;
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, AppEvent::TransferStarted { .. }))
    );
}

#[tokio::test]
async fn test_cancel_before_start() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "note.txt", b"unsent");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let (send_tx, _send_rx) = mpsc::channel::<AppEvent>(1000);
    let outcome = spawn_send(
        path,
        "127.0.0.1:9".parse().unwrap(),
        AdaptiveConfig::default(),
        send_tx,
        cancel,
    )
    .wait()
    .await;

    assert_eq!(outcome, TransferOutcome::Cancelled);
}

#[tokio::test]
async fn test_cancel_stalled_send() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "big.bin", &test_data(64 * 1024 * 1024));

    // Accepts but never reads, so the sender fills the socket buffers and blocks
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        drop(stream);
    });

    let (send_tx, mut send_rx) = mpsc::channel::<AppEvent>(1000);
    let handle = spawn_send(
        path,
        addr,
        AdaptiveConfig::default(),
        send_tx,
        CancellationToken::new(),
    );

    wait_for(&mut send_rx, |e| {
        matches!(e, AppEvent::TransferStarted { .. })
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    handle.cancel();

    let outcome = tokio::time::timeout(EVENT_TIMEOUT, handle.wait())
        .await
        .expect("Cancelled send did not stop");
    assert_eq!(outcome, TransferOutcome::Cancelled);

    sink.abort();
}
