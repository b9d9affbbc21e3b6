mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use beatbar_types::PlaybackStatus;
use common::{Script, ScriptedDecoder, config, params, track, wait_until};
use stream_player::playlist::{LastPlaylist, PlaylistStore};
use stream_player::sequencer::{TrackQueue, run_queue};
use stream_player::sink::MemoryBackend;
use stream_player::{PlaybackController, Player};

#[test]
fn plays_queue_end_to_end_one_device_at_a_time() {
    let decoder = ScriptedDecoder::new(Script::Frames(3));
    let output = MemoryBackend::new();
    let mut ctl = PlaybackController::new(
        config(),
        params(),
        Arc::new(decoder.clone()),
        Arc::new(output.clone()),
    );
    let mut queue = TrackQueue::new(vec![track("a"), track("b"), track("c")]);

    let status = run_queue(&mut ctl, &mut queue, None).unwrap();

    assert_eq!(status, PlaybackStatus::Stopped);
    assert_eq!(decoder.launches(), 3);
    let log = output.log();
    assert_eq!(log.frames.len(), 9);
    assert_eq!((log.opened, log.closed, log.max_open), (3, 3, 1));
}

#[test]
fn skip_to_then_exit_persists_position() {
    let dir = tempfile::tempdir().unwrap();
    let store = PlaylistStore::in_dir(dir.path());
    let decoder = ScriptedDecoder::new(Script::Endless);
    let output = MemoryBackend::new().with_write_delay(Duration::from_millis(2));
    let mut ctl = PlaybackController::new(
        config(),
        params(),
        Arc::new(decoder.clone()),
        Arc::new(output.clone()),
    );
    let handle = ctl.handle();

    let mut queue = TrackQueue::new(vec![track("a"), track("b"), track("c")]);
    assert!(queue.skip_to("b"));

    let store_for_thread = store.clone();
    let worker = thread::spawn(move || {
        let status = run_queue(&mut ctl, &mut queue, Some(&store_for_thread));
        ctl.exit();
        (status, queue)
    });

    assert!(wait_until(Duration::from_secs(3), || !output.log().frames.is_empty()));
    handle.exit();
    let (status, queue) = worker.join().unwrap();

    assert_eq!(status.unwrap(), PlaybackStatus::Exit);
    assert_eq!(decoder.launches(), 1);
    assert_eq!(queue.current().map(|t| t.id.as_str()), Some("b"));

    let saved: LastPlaylist = store.load().unwrap().unwrap();
    assert_eq!(saved.current.as_deref(), Some("b"));
    let resumed = saved.into_queue();
    assert_eq!(resumed.cursor(), 1);
}
