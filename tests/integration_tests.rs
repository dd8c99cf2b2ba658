//! End-to-end tests over loopback TCP.
//!
//! Every test runs a real server with its own storage directory and talks to
//! it through either the client agent or a frame-level raw client.

use chatwire_client::AgentEvent;
use chatwire_integration_tests::{RawClient, TestClient, TestServer, eventually};
use chatwire_proto::frame::FrameBuilder;
use chatwire_proto::{ClientFrame, DownloadNotice, MAX_FILE_SIZE, ServerFrame};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

const QUIET: Duration = Duration::from_millis(300);

/// Connect alice, bob and carol in order and wait until all rosters agree.
async fn three_clients(server: &TestServer) -> (TestClient, TestClient, TestClient) {
    let mut alice = TestClient::connect(server, "alice").await;
    alice.wait_for_roster(&["alice"]).await;
    let mut bob = TestClient::connect(server, "bob").await;
    bob.wait_for_roster(&["alice", "bob"]).await;
    let mut carol = TestClient::connect(server, "carol").await;

    for client in [&mut alice, &mut bob, &mut carol] {
        client.wait_for_roster(&["alice", "bob", "carol"]).await;
    }
    (alice, bob, carol)
}

fn messages(events: &[AgentEvent]) -> Vec<(Option<String>, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::MessageReceived { sender, text } => Some((sender.clone(), text.clone())),
            _ => None,
        })
        .collect()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// ============================================================================
// Roster and Chat
// ============================================================================

#[tokio::test]
async fn test_roster_after_sequential_connects() {
    let server = TestServer::start().await;
    let (alice, bob, carol) = three_clients(&server).await;

    let uids: HashSet<String> = alice
        .agent
        .roster()
        .await
        .into_iter()
        .map(|e| e.uid)
        .collect();
    assert_eq!(uids.len(), 3);

    for client in [&bob, &carol] {
        let other: HashSet<String> = client
            .agent
            .roster()
            .await
            .into_iter()
            .map(|e| e.uid)
            .collect();
        assert_eq!(other, uids);
    }

    let mut names = server.registry().usernames().await;
    names.sort();
    assert_eq!(names, ["alice", "bob", "carol"]);
}

#[tokio::test]
async fn test_roster_events_not_repeated() {
    let server = TestServer::start().await;
    let (mut alice, _bob, _carol) = three_clients(&server).await;

    // The server re-sent alice's roster on every join; each uid surfaces once.
    let joined: Vec<String> = alice
        .drain(QUIET)
        .await
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::UserConnected { username, .. } => Some(username),
            _ => None,
        })
        .collect();
    assert_eq!(joined, ["alice", "bob", "carol"]);
}

#[tokio::test]
async fn test_message_relay() {
    let server = TestServer::start().await;
    let (alice, mut bob, mut carol) = three_clients(&server).await;
    let _ = bob.drain(QUIET).await;
    let _ = carol.drain(QUIET).await;

    alice.agent.send_message("hi").await.unwrap();

    for client in [&mut bob, &mut carol] {
        let received = messages(&client.drain(QUIET).await);
        assert_eq!(received, [(Some("alice".to_string()), "hi".to_string())]);
    }
}

#[tokio::test]
async fn test_message_with_colon_keeps_body() {
    let server = TestServer::start().await;
    let mut alice = TestClient::connect(&server, "alice").await;
    alice.wait_for_roster(&["alice"]).await;

    alice.agent.send_message("note: 3:00 pm").await.unwrap();
    let (sender, text) = alice
        .wait_for(|e| match e {
            AgentEvent::MessageReceived { sender, text } => Some((sender.clone(), text.clone())),
            _ => None,
        })
        .await;
    assert_eq!(sender.as_deref(), Some("alice"));
    assert_eq!(text, "note: 3:00 pm");
}

#[tokio::test]
async fn test_disconnect_notification() {
    let server = TestServer::start().await;
    let (alice, mut bob, mut carol) = three_clients(&server).await;
    let alice_uid = bob
        .agent
        .roster()
        .await
        .into_iter()
        .find(|e| e.username == "alice")
        .unwrap()
        .uid;
    let _ = bob.drain(QUIET).await;
    let _ = carol.drain(QUIET).await;

    alice.agent.disconnect().await.unwrap();

    for client in [&mut bob, &mut carol] {
        let events = client.drain(QUIET).await;
        let departures: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::UserDisconnected { .. }))
            .collect();
        assert_eq!(
            departures,
            [&AgentEvent::UserDisconnected {
                uid: alice_uid.clone(),
                username: Some("alice".to_string()),
            }]
        );
        assert_eq!(
            messages(&events),
            [(None, "alice has disconnected.".to_string())]
        );
        client.wait_for_roster(&["bob", "carol"]).await;
    }

    assert_eq!(server.registry().session_count().await, 2);
}

#[tokio::test]
async fn test_departed_user_not_reannounced() {
    let server = TestServer::start().await;
    let (alice, mut bob, _carol) = three_clients(&server).await;
    alice.agent.disconnect().await.unwrap();
    bob.wait_for_roster(&["bob", "carol"]).await;

    let _dave = TestClient::connect(&server, "dave").await;
    bob.wait_for_roster(&["bob", "carol", "dave"]).await;

    let events = bob.drain(QUIET).await;
    assert!(!events.iter().any(|e| matches!(
        e,
        AgentEvent::UserConnected { username, .. } if username == "alice"
    )));
}

// ============================================================================
// File Transfer
// ============================================================================

#[tokio::test]
async fn test_upload_announce_download() {
    let server = TestServer::start().await;
    let (mut alice, bob, mut carol) = three_clients(&server).await;

    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("report.pdf");
    let content = pattern(200 * 1024);
    tokio::fs::write(&path, &content).await.unwrap();

    let mut percents = Vec::new();
    bob.agent
        .send_file(&path, |p| percents.push(p))
        .await
        .unwrap();
    assert_eq!(percents, [32, 64, 96, 100]);

    let mut announced = Vec::new();
    for client in [&mut alice, &mut carol] {
        let (sender, name) = client
            .wait_for(|e| match e {
                AgentEvent::FileAnnounced { sender, name } => Some((sender.clone(), name.clone())),
                _ => None,
            })
            .await;
        assert_eq!(sender, "bob");
        assert!(name.starts_with("report"));
        announced.push(name);
    }
    assert_eq!(announced[0], announced[1]);
    let name = announced.remove(0);

    carol.agent.request_download(&name, None).await.unwrap();
    let path = carol
        .wait_for(|e| match e {
            AgentEvent::DownloadComplete { path, .. } => Some(path.clone()),
            AgentEvent::DownloadFailed { reason, .. } => panic!("download failed: {reason}"),
            _ => None,
        })
        .await;
    assert_eq!(path, carol.downloads().join(&name));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), content);

    assert_eq!(server.stored_files(), [name]);
    assert!(server.staging_files().is_empty());
}

#[tokio::test]
async fn test_download_from_disk_without_cache() {
    let server = TestServer::start_with(|config| config.cache_budget = 0).await;
    let mut alice = TestClient::connect(&server, "alice").await;
    alice.wait_for_roster(&["alice"]).await;

    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("big.bin");
    let content = pattern(150 * 1024 + 7);
    tokio::fs::write(&path, &content).await.unwrap();
    alice.agent.send_file(&path, |_| {}).await.unwrap();
    alice
        .wait_for(|e| matches!(e, AgentEvent::FileAnnounced { .. }).then_some(()))
        .await;

    let save = alice.downloads().join("nested/copy.bin");
    alice
        .agent
        .request_download("big.bin", Some(save.clone()))
        .await
        .unwrap();

    let mut progress = Vec::new();
    let saved = alice
        .wait_for(|e| match e {
            AgentEvent::DownloadProgress { percent, .. } => {
                progress.push(*percent);
                None
            }
            AgentEvent::DownloadComplete { path, .. } => Some(path.clone()),
            _ => None,
        })
        .await;
    assert_eq!(saved, save);
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(tokio::fs::read(&save).await.unwrap(), content);
}

#[tokio::test]
async fn test_upload_name_collisions() {
    let server = TestServer::start().await;
    let mut alice = TestClient::connect(&server, "alice").await;
    alice.wait_for_roster(&["alice"]).await;

    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("dup.txt");
    tokio::fs::write(&path, b"same name").await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        alice.agent.send_file(&path, |_| {}).await.unwrap();
        names.push(
            alice
                .wait_for(|e| match e {
                    AgentEvent::FileAnnounced { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .await,
        );
    }
    assert_eq!(names, ["dup.txt", "dup_1.txt", "dup_2.txt"]);
    assert_eq!(server.stored_files(), ["dup.txt", "dup_1.txt", "dup_2.txt"]);
}

#[tokio::test]
async fn test_oversized_upload_rejected_before_chunks() {
    let server = TestServer::start().await;
    let mut raw = RawClient::connect(&server, "mallory").await;

    for size in [MAX_FILE_SIZE as i64 + 1, 0, -5] {
        raw.send(&ClientFrame::UploadStart {
            name: "huge.iso".into(),
            size,
        })
        .await;
        let notices = raw.notices().await;
        assert_eq!(notices.len(), 1, "size {size}: {notices:?}");
        assert!(notices[0].contains("huge.iso"));

        assert!(server.staging_files().is_empty());
    }

    // Trailing chunks and completion are dropped quietly.
    raw.send(&ClientFrame::UploadChunk { data: vec![1; 16] }).await;
    raw.send(&ClientFrame::UploadComplete).await;
    assert!(raw.notices().await.is_empty());
    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn test_overflowing_chunk_aborts_upload() {
    let server = TestServer::start().await;
    let mut raw = RawClient::connect(&server, "mallory").await;

    raw.send(&ClientFrame::UploadStart {
        name: "small.txt".into(),
        size: 10,
    })
    .await;
    raw.send(&ClientFrame::UploadChunk { data: vec![1; 8] }).await;
    raw.sync().await;
    assert_eq!(server.staging_files().len(), 1);

    raw.send(&ClientFrame::UploadChunk { data: vec![2; 8] }).await;
    let notices = raw.notices().await;
    assert_eq!(notices.len(), 1);
    assert!(server.staging_files().is_empty());

    raw.send(&ClientFrame::UploadComplete).await;
    raw.sync().await;
    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn test_invalid_chunk_sizes_keep_stream_in_sync() {
    let server = TestServer::start_with(|config| config.upload_limits.max_chunk_size = 64).await;
    let mut raw = RawClient::connect(&server, "mallory").await;

    raw.send(&ClientFrame::UploadStart {
        name: "notes.txt".into(),
        size: 4,
    })
    .await;
    // Oversized chunk: its bytes are drained, the upload stays active.
    raw.send(&ClientFrame::UploadChunk { data: vec![9; 100] }).await;
    raw.send(&ClientFrame::InvalidChunk { declared: -1 }).await;
    assert_eq!(raw.notices().await.len(), 2);

    raw.send(&ClientFrame::UploadChunk {
        data: b"abcd".to_vec(),
    })
    .await;
    raw.send(&ClientFrame::UploadComplete).await;
    let frames = raw.sync().await;
    assert!(frames.contains(&ServerFrame::FileAnnounced {
        sender: "mallory".into(),
        name: "notes.txt".into(),
    }));
    assert_eq!(
        std::fs::read(server.storage().join("notes.txt")).unwrap(),
        b"abcd"
    );
}

#[tokio::test]
async fn test_concurrent_uploads_do_not_interleave() {
    let server = TestServer::start().await;
    let mut a = RawClient::connect(&server, "alice").await;
    let mut b = RawClient::connect(&server, "bob").await;

    a.send(&ClientFrame::UploadStart {
        name: "a.bin".into(),
        size: 12,
    })
    .await;
    b.send(&ClientFrame::UploadStart {
        name: "b.bin".into(),
        size: 12,
    })
    .await;
    for _ in 0..3 {
        a.send(&ClientFrame::UploadChunk { data: b"AAAA".to_vec() }).await;
        b.send(&ClientFrame::UploadChunk { data: b"BBBB".to_vec() }).await;
    }
    a.send(&ClientFrame::UploadComplete).await;
    b.send(&ClientFrame::UploadComplete).await;
    a.sync().await;
    b.sync().await;

    assert_eq!(server.stored_files(), ["a.bin", "b.bin"]);
    assert_eq!(
        std::fs::read(server.storage().join("a.bin")).unwrap(),
        [b'A'; 12]
    );
    assert_eq!(
        std::fs::read(server.storage().join("b.bin")).unwrap(),
        [b'B'; 12]
    );
}

#[tokio::test]
async fn test_concurrent_agent_uploads() {
    let server = TestServer::start().await;
    let mut alice = TestClient::connect(&server, "alice").await;
    let bob = TestClient::connect(&server, "bob").await;
    alice.wait_for_roster(&["alice", "bob"]).await;

    let source = tempfile::tempdir().unwrap();
    let first = source.path().join("first.bin");
    let second = source.path().join("second.bin");
    let first_content = pattern(300 * 1024);
    let second_content: Vec<u8> = pattern(260 * 1024).into_iter().rev().collect();
    tokio::fs::write(&first, &first_content).await.unwrap();
    tokio::fs::write(&second, &second_content).await.unwrap();

    let (a, b) = tokio::join!(
        alice.agent.send_file(&first, |_| {}),
        bob.agent.send_file(&second, |_| {})
    );
    a.unwrap();
    b.unwrap();

    let mut seen = HashSet::new();
    while seen.len() < 2 {
        seen.insert(
            alice
                .wait_for(|e| match e {
                    AgentEvent::FileAnnounced { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .await,
        );
    }

    assert_eq!(
        std::fs::read(server.storage().join("first.bin")).unwrap(),
        first_content
    );
    assert_eq!(
        std::fs::read(server.storage().join("second.bin")).unwrap(),
        second_content
    );
}

#[tokio::test]
async fn test_uploads_from_one_agent_do_not_mix() {
    let server = TestServer::start().await;
    let mut alice = TestClient::connect(&server, "alice").await;
    alice.wait_for_roster(&["alice"]).await;

    let source = tempfile::tempdir().unwrap();
    let first = source.path().join("a.bin");
    let second = source.path().join("b.bin");
    tokio::fs::write(&first, vec![b'A'; 200 * 1024]).await.unwrap();
    tokio::fs::write(&second, vec![b'B'; 400 * 1024]).await.unwrap();

    let (a, b) = tokio::join!(
        tokio::spawn({
            let agent = Arc::clone(&alice.agent);
            let path = first.clone();
            async move { agent.send_file(&path, |_| {}).await }
        }),
        tokio::spawn({
            let agent = Arc::clone(&alice.agent);
            let path = second.clone();
            async move { agent.send_file(&path, |_| {}).await }
        })
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    let mut seen = HashSet::new();
    while seen.len() < 2 {
        seen.insert(
            alice
                .wait_for(|e| match e {
                    AgentEvent::FileAnnounced { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .await,
        );
    }
    assert_eq!(seen, HashSet::from(["a.bin".to_string(), "b.bin".to_string()]));

    assert_eq!(
        std::fs::read(server.storage().join("a.bin")).unwrap(),
        vec![b'A'; 200 * 1024]
    );
    assert_eq!(
        std::fs::read(server.storage().join("b.bin")).unwrap(),
        vec![b'B'; 400 * 1024]
    );
}

#[tokio::test]
async fn test_refused_download_reported() {
    let server = TestServer::start().await;
    let mut bob = TestClient::connect(&server, "bob").await;
    bob.wait_for_roster(&["bob"]).await;

    bob.agent.request_download("missing.txt", None).await.unwrap();
    let (name, reason) = bob
        .wait_for(|e| match e {
            AgentEvent::DownloadFailed { name, reason } => Some((name.clone(), reason.clone())),
            _ => None,
        })
        .await;
    assert_eq!(name, "missing.txt");
    assert_eq!(
        DownloadNotice::parse(&reason),
        Some(DownloadNotice::Unavailable("missing.txt"))
    );
    assert!(!bob.downloads().join("missing.txt").exists());
}

#[tokio::test]
async fn test_disconnect_mid_upload_leaves_no_artifact() {
    let server = TestServer::start().await;
    let mut raw = RawClient::connect(&server, "mallory").await;

    raw.send(&ClientFrame::UploadStart {
        name: "partial.bin".into(),
        size: 1000,
    })
    .await;
    raw.send(&ClientFrame::UploadChunk { data: vec![5; 100] }).await;
    raw.sync().await;
    assert_eq!(server.staging_files().len(), 1);

    drop(raw);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.registry().session_count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    eventually("staging file removal", || server.staging_files().is_empty()).await;
    assert!(server.stored_files().is_empty());
}

#[tokio::test]
async fn test_stale_upload_reaped() {
    let server = TestServer::start_with(|config| {
        config.upload_limits.timeout = Some(Duration::from_millis(100));
        config.cleanup_interval = Duration::from_millis(50);
    })
    .await;
    let mut raw = RawClient::connect(&server, "slowpoke").await;

    raw.send(&ClientFrame::UploadStart {
        name: "slow.bin".into(),
        size: 100,
    })
    .await;
    raw.send(&ClientFrame::UploadChunk { data: vec![1; 10] }).await;

    let notice = loop {
        if let ServerFrame::Message { text } = raw.next_frame().await {
            if text.contains("timed out") {
                break text;
            }
        }
    };
    assert!(notice.contains("slow.bin"));
    assert!(server.staging_files().is_empty());
}

// ============================================================================
// Protocol Robustness
// ============================================================================

#[tokio::test]
async fn test_unknown_opcode_tolerated() {
    let server = TestServer::start().await;
    let mut raw = RawClient::connect(&server, "mallory").await;

    raw.send_raw(&FrameBuilder::with_raw_opcode(99).build()).await;
    raw.send_raw(&FrameBuilder::with_raw_opcode(42).build()).await;
    raw.sync().await;
    assert_eq!(server.registry().session_count().await, 1);
}

#[tokio::test]
async fn test_download_path_traversal_refused() {
    let server = TestServer::start().await;
    let mut raw = RawClient::connect(&server, "mallory").await;

    for name in ["../secret.txt", "..\\secret.txt", "/etc/passwd", "", "missing.txt"] {
        raw.send(&ClientFrame::DownloadRequest { name: name.into() })
            .await;
        let frames = raw.sync().await;
        assert!(
            !frames
                .iter()
                .any(|f| matches!(f, ServerFrame::DownloadStart { .. })),
            "{name:?} was served"
        );
        assert_eq!(
            frames
                .iter()
                .filter(|f| matches!(f, ServerFrame::Message { .. }))
                .count(),
            1,
            "{name:?}"
        );
    }
}

#[tokio::test]
async fn test_handshake_required() {
    let server = TestServer::start_with(|config| {
        config.handshake_timeout = Duration::from_millis(200);
    })
    .await;

    // Silent connection is dropped after the handshake timeout.
    let mut silent = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // A chat frame in place of the handshake is refused.
    let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        &ClientFrame::Message { text: "hi".into() }.encode(),
    )
    .await
    .unwrap();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server.registry().session_count().await, 0);
}
