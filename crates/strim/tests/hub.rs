mod common;

use std::time::Duration;

use common::{Call, FakePlayer, TestViewer, start_server, wait_event};
use strim::{DisconnectReason, Packet, PacketKind, ServerEvent};

const QUIET: Duration = Duration::from_millis(200);

/// Joins a viewer and completes its handshake.
async fn ready_viewer(addr: std::net::SocketAddr) -> TestViewer {
    let (mut viewer, _) = TestViewer::join(addr).await;
    viewer.send(&Packet::ready()).await;
    viewer
}

#[tokio::test]
async fn test_join_pauses_host_and_sends_init() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 12.5);
    let hub = start_server(player.clone()).await;

    let (mut viewer, init) = TestViewer::join(hub.addr).await;
    let init = init.init_payload().unwrap();
    assert_eq!(init.title, "Movie");
    assert_eq!(init.position, 12.5);
    assert!(player.paused());

    viewer.send(&Packet::ready()).await;
    assert_eq!(viewer.recv().await.kind(), PacketKind::Resume);
    player.wait_for_call(|c| *c == Call::SetPaused(false)).await;
    assert!(!player.paused());
}

#[tokio::test]
async fn test_single_resume_after_last_of_three_ready() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let hub = start_server(player.clone()).await;

    let (mut a, _) = TestViewer::join(hub.addr).await;
    let (mut b, _) = TestViewer::join(hub.addr).await;
    let (mut c, _) = TestViewer::join(hub.addr).await;
    assert_eq!(hub.server.stats().pending_ready, 3);

    a.send(&Packet::ready()).await;
    b.send(&Packet::ready()).await;
    a.expect_silence(QUIET).await;
    assert!(player.paused());

    c.send(&Packet::ready()).await;
    for viewer in [&mut a, &mut b, &mut c] {
        assert_eq!(viewer.recv().await.kind(), PacketKind::Resume);
    }
    for viewer in [&mut a, &mut b, &mut c] {
        viewer.expect_silence(QUIET).await;
    }

    let calls = player.calls();
    assert_eq!(calls.iter().filter(|c| **c == Call::SetPaused(true)).count(), 1);
    assert_eq!(calls.iter().filter(|c| **c == Call::SetPaused(false)).count(), 1);
}

#[tokio::test]
async fn test_duplicate_ready_does_not_release_gate() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let hub = start_server(player.clone()).await;

    let (mut a, _) = TestViewer::join(hub.addr).await;
    let (_b, _) = TestViewer::join(hub.addr).await;

    a.send(&Packet::ready()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.send(&Packet::ready()).await;

    a.expect_silence(QUIET).await;
    assert_eq!(hub.server.stats().pending_ready, 1);
    assert!(player.paused());
}

#[tokio::test]
async fn test_disconnect_before_ready_does_not_block_gate() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let mut hub = start_server(player.clone()).await;

    let (mut a, _) = TestViewer::join(hub.addr).await;
    let (b, _) = TestViewer::join(hub.addr).await;

    a.send(&Packet::ready()).await;
    drop(b);

    assert_eq!(a.recv().await.kind(), PacketKind::Resume);
    wait_event(&mut hub.events, |e| {
        matches!(
            e,
            ServerEvent::ViewerDisconnected {
                viewer_id: 1,
                reason: DisconnectReason::Graceful
            }
        )
    })
    .await;

    let stats = hub.server.stats();
    assert_eq!(stats.alive_count, 1);
    assert_eq!(stats.pending_ready, 0);
    assert_eq!(stats.total_count, 2);
}

#[tokio::test]
async fn test_viewer_pause_reaches_host_and_other_viewers() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let hub = start_server(player.clone()).await;

    let (mut a, _) = TestViewer::join(hub.addr).await;
    let mut b = ready_viewer(hub.addr).await;
    a.send(&Packet::ready()).await;
    assert_eq!(a.recv().await.kind(), PacketKind::Resume);
    assert_eq!(b.recv().await.kind(), PacketKind::Resume);

    a.send(&Packet::pause()).await;

    assert_eq!(b.recv().await, Packet::pause());
    player.wait_for_call(|c| *c == Call::SetPaused(true)).await;
    // The host's own pause event is an echo and must not come back to `a`.
    a.expect_silence(QUIET).await;
    assert!(player.paused());
}

#[tokio::test]
async fn test_viewer_seek_is_applied_and_forwarded_verbatim() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let hub = start_server(player.clone()).await;

    let (mut a, _) = TestViewer::join(hub.addr).await;
    let mut b = ready_viewer(hub.addr).await;
    a.send(&Packet::ready()).await;
    a.recv().await;
    b.recv().await;

    a.send(&Packet::seek(30.0)).await;

    let forwarded = b.recv().await;
    assert_eq!(forwarded.kind(), PacketKind::Seek);
    assert_eq!(forwarded.position().unwrap(), 30.0);
    player.wait_for_call(|c| *c == Call::Seek(30.0)).await;
    a.expect_silence(QUIET).await;
}

#[tokio::test]
async fn test_host_changes_are_broadcast_without_reapplying() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let hub = start_server(player.clone()).await;

    let mut viewer = ready_viewer(hub.addr).await;
    assert_eq!(viewer.recv().await.kind(), PacketKind::Resume);

    // Let the join's own pause and resume age out of the debounce window.
    tokio::time::sleep(Duration::from_millis(150)).await;
    player.clear_calls();

    player.user_pause(true);
    assert_eq!(viewer.recv().await, Packet::pause());

    player.user_seek(42.0);
    let seek = viewer.recv().await;
    assert_eq!(seek.position().unwrap(), 42.0);

    assert!(player.calls().is_empty(), "host re-applied: {:?}", player.calls());
}

#[tokio::test]
async fn test_join_while_paused_keeps_host_paused() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 5.0);
    player.user_pause(true);
    let hub = start_server(player.clone()).await;

    let mut viewer = ready_viewer(hub.addr).await;
    viewer.expect_silence(QUIET).await;

    assert!(player.paused());
    assert!(!player.calls().contains(&Call::SetPaused(false)));
    assert!(hub.server.stats().paused);
}

#[tokio::test]
async fn test_malformed_packets_disconnect_only_the_sender() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let mut hub = start_server(player.clone()).await;

    let (mut bad_kind, _) = TestViewer::join(hub.addr).await;
    let (mut short_seek, _) = TestViewer::join(hub.addr).await;
    let mut good = ready_viewer(hub.addr).await;

    bad_kind.send_raw(&[9]).await;
    bad_kind.expect_closed().await;
    wait_event(&mut hub.events, |e| {
        matches!(
            e,
            ServerEvent::ViewerDisconnected {
                viewer_id: 0,
                reason: DisconnectReason::Protocol
            }
        )
    })
    .await;

    short_seek.send_raw(&[PacketKind::Seek as u8, 0x40, 0x00]).await;
    short_seek.expect_closed().await;

    // Both broken viewers left before Ready, so the healthy one resumes.
    assert_eq!(good.recv().await.kind(), PacketKind::Resume);
    assert_eq!(hub.server.stats().alive_count, 1);
}

#[tokio::test]
async fn test_reinitialize_on_new_media() {
    let player = FakePlayer::with_media("/media/first.mkv", "First", 0.0);
    let mut hub = start_server(player.clone()).await;

    let (mut a, _) = TestViewer::join(hub.addr).await;
    let mut b = ready_viewer(hub.addr).await;
    a.send(&Packet::ready()).await;
    a.recv().await;
    b.recv().await;

    player.open("/media/second.mkv", "Second");

    for viewer in [&mut a, &mut b] {
        assert_eq!(viewer.recv().await, Packet::idle());
        let init = viewer.recv().await;
        assert_eq!(init.kind(), PacketKind::Init);
        assert_eq!(init.init_payload().unwrap().title, "Second");
    }
    wait_event(&mut hub.events, |e| {
        matches!(e, ServerEvent::MediaChanged { title } if title == "Second")
    })
    .await;

    let stats = hub.server.stats();
    assert_eq!(stats.pending_ready, 2);
    assert_eq!(stats.title, "Second");
    assert!(player.paused());

    a.send(&Packet::ready()).await;
    a.expect_silence(QUIET).await;
    b.send(&Packet::ready()).await;

    assert_eq!(a.recv().await.kind(), PacketKind::Resume);
    assert_eq!(b.recv().await.kind(), PacketKind::Resume);
    player.wait_for_call(|c| *c == Call::SetPaused(false)).await;
}

#[tokio::test]
async fn test_reload_during_join_still_resumes_host() {
    let player = FakePlayer::with_media("/media/first.mkv", "First", 0.0);
    let hub = start_server(player.clone()).await;

    let (mut viewer, _) = TestViewer::join(hub.addr).await;
    assert!(player.paused());

    player.open("/media/second.mkv", "Second");
    assert_eq!(viewer.recv().await, Packet::idle());
    let init = viewer.recv().await;
    assert_eq!(init.init_payload().unwrap().title, "Second");

    // One Ready per Init: the first answers the superseded one.
    viewer.send(&Packet::ready()).await;
    viewer.expect_silence(QUIET).await;
    assert_eq!(hub.server.stats().pending_ready, 1);

    viewer.send(&Packet::ready()).await;
    assert_eq!(viewer.recv().await.kind(), PacketKind::Resume);
    player.wait_for_call(|c| *c == Call::SetPaused(false)).await;
    assert!(!player.paused());
    assert_eq!(hub.server.stats().pending_ready, 0);
}

#[tokio::test]
async fn test_failed_join_reverts_host_pause() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let mut hub = start_server(player.clone()).await;
    player.set_position_unavailable(true);

    let mut viewer = TestViewer::connect(hub.addr).await;
    viewer.expect_closed().await;
    wait_event(&mut hub.events, |e| {
        matches!(
            e,
            ServerEvent::ViewerDisconnected {
                viewer_id: 0,
                reason: DisconnectReason::JoinFailed
            }
        )
    })
    .await;

    player.wait_for_call(|c| *c == Call::SetPaused(false)).await;
    assert_eq!(
        player.calls(),
        vec![Call::SetPaused(true), Call::SetPaused(false)]
    );
    assert!(!player.paused());

    let stats = hub.server.stats();
    assert_eq!(stats.alive_count, 0);
    assert_eq!(stats.pending_ready, 0);
    assert!(!stats.paused);
}

#[tokio::test]
async fn test_title_falls_back_to_file_name() {
    let player = FakePlayer::new();
    player.open("/media/untitled.mkv", "");
    let hub = start_server(player.clone()).await;

    let (_viewer, init) = TestViewer::join(hub.addr).await;
    assert_eq!(init.init_payload().unwrap().title, "untitled.mkv");
}

#[tokio::test]
async fn test_player_shutdown_stops_server() {
    let player = FakePlayer::with_media("/media/movie.mkv", "Movie", 0.0);
    let hub = start_server(player.clone()).await;

    let mut viewer = ready_viewer(hub.addr).await;
    viewer.recv().await;

    player.quit();

    let result = tokio::time::timeout(common::TIMEOUT, hub.task)
        .await
        .expect("server kept running");
    assert!(result.unwrap().is_ok());
    viewer.expect_closed().await;
    assert!(!hub.server.is_running());
}
