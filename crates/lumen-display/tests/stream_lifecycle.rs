//! Stream detection end to end: promotion after a sustained sequence,
//! frame delivery through the encoder, demotion on timeout, and the
//! report feedback loop.

mod common;

use common::{count_pipe_items, TestRig, BASE_TIME, MSEC};
use lumen_display::encoder::StreamReport;
use lumen_display::stream::{STREAM_FRAMES_START_CONDITION, STREAM_TIMEOUT};
use lumen_display::PipeItem;
use lumen_gfx::Rect;

const BBOX: Rect = Rect::new(10, 10, 138, 106);

/// Feeds identical frames 50 ms apart until the start condition is met.
/// The N-th frame inherits N-1 predecessor frames from the trace, so the
/// slot allocates on frame `START_CONDITION + 1`.
fn promote(rig: &mut TestRig) -> u64 {
    let mut now = BASE_TIME;
    for _ in 0..=STREAM_FRAMES_START_CONDITION {
        rig.feed_copy(BBOX, now);
        now += 50 * MSEC;
    }
    now
}

#[test]
fn sustained_matching_frames_promote_to_a_stream() {
    let mut rig = TestRig::filter_rig();
    let client = rig.attach_default_client();

    let now = promote(&mut rig);

    let creates = count_pipe_items(&rig.worker.state, client, |i| {
        matches!(i, PipeItem::StreamCreate { .. })
    });
    assert_eq!(creates, 1, "exactly one stream-create per client");
    // The client asked for stream reports, so activation follows.
    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::StreamActivateReport { .. }
        )),
        1
    );

    // The promoted frame itself went out as a stream frame already.
    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::StreamData { .. }
        )),
        1
    );

    // The next matching drawable is a stream frame, not a draw item.
    let draws_before = count_pipe_items(&rig.worker.state, client, |i| {
        matches!(i, PipeItem::Draw { .. })
    });
    rig.feed_copy(BBOX, now);
    let draws_after = count_pipe_items(&rig.worker.state, client, |i| {
        matches!(i, PipeItem::Draw { .. })
    });
    assert_eq!(draws_before, draws_after, "streamed frame must not queue a draw");
    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::StreamData { .. }
        )),
        2
    );
    assert_eq!(rig.encoder_state.lock().unwrap().frames, 2);
}

#[test]
fn a_short_sequence_does_not_promote() {
    let mut rig = TestRig::filter_rig();
    let client = rig.attach_default_client();

    let mut now = BASE_TIME;
    for _ in 0..STREAM_FRAMES_START_CONDITION {
        rig.feed_copy(BBOX, now);
        now += 50 * MSEC;
    }
    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::StreamCreate { .. }
        )),
        0
    );
}

#[test]
fn stalled_stream_is_demoted_with_an_upgrade() {
    let mut rig = TestRig::filter_rig();
    let client = rig.attach_default_client();

    let now = promote(&mut rig);
    rig.feed_copy(BBOX, now);

    // Nothing for 1.1 seconds; the sweep demotes.
    let later = now + STREAM_TIMEOUT + 100 * MSEC;
    rig.worker.state.stream_timeout(later);

    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::StreamDestroy { .. }
        )),
        1
    );
    // The demotion leaves the client with lossless content: either an
    // upgrade of the last frame or a surface snapshot.
    let upgrades = count_pipe_items(&rig.worker.state, client, |i| {
        matches!(i, PipeItem::Upgrade { .. } | PipeItem::Image(_))
    });
    assert_eq!(upgrades, 1);

    // The slot is reusable: a new sequence can promote again.
    let mut now = later + MSEC;
    for _ in 0..=STREAM_FRAMES_START_CONDITION {
        rig.feed_copy(BBOX, now);
        now += 50 * MSEC;
    }
    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::StreamCreate { .. }
        )),
        2
    );
}

#[test]
fn stale_report_is_ignored_and_rejection_kills_the_encoder() {
    let mut rig = TestRig::filter_rig();
    let client = rig.attach_default_client();
    let now = promote(&mut rig);

    let report_id = rig.worker.state.client(client).unwrap().stream_agents[0].report_id;

    // Stale unique id: silently ignored.
    rig.worker.state.handle_stream_report(
        client,
        StreamReport {
            stream_id: 0,
            unique_id: report_id.wrapping_add(1),
            start_frame_mm_time: 0,
            end_frame_mm_time: 100,
            num_frames: 5,
            num_drops: 0,
            last_frame_delay: 0,
            audio_delay: 0,
        },
    );
    assert_eq!(rig.encoder_state.lock().unwrap().reports, 0);

    // Valid report reaches the encoder.
    rig.worker.state.handle_stream_report(
        client,
        StreamReport {
            stream_id: 0,
            unique_id: report_id,
            start_frame_mm_time: 0,
            end_frame_mm_time: 100,
            num_frames: 5,
            num_drops: 1,
            last_frame_delay: 30,
            audio_delay: 0,
        },
    );
    assert_eq!(rig.encoder_state.lock().unwrap().reports, 1);
    // The stub returns the delay as required latency; it must reach the
    // main channel.
    assert_eq!(*rig.main.latency.lock().unwrap(), 30);

    // The decoder-rejection sentinel destroys the encoder...
    rig.worker.state.handle_stream_report(
        client,
        StreamReport {
            stream_id: 0,
            unique_id: report_id,
            start_frame_mm_time: 0,
            end_frame_mm_time: 0,
            num_frames: 0,
            num_drops: u32::MAX,
            last_frame_delay: 0,
            audio_delay: 0,
        },
    );
    assert!(rig.worker.state.client(client).unwrap().stream_agents[0]
        .encoder
        .is_none());

    // ...after which frames fall back to the lossless path.
    rig.feed_copy(BBOX, now);
    assert_eq!(
        count_pipe_items(&rig.worker.state, client, |i| matches!(
            i,
            PipeItem::Draw { .. }
        )),
        1
    );
}

#[test]
fn overlapping_drawable_detaches_the_stream_behind_it() {
    let mut rig = TestRig::filter_rig();
    let client = rig.attach_default_client();
    let now = promote(&mut rig);
    rig.feed_copy(BBOX, now);
    assert!(rig.worker.state.streams[0].current.is_some());

    // A non-streamable drawable (blend effect) over the stream area.
    let mut overlap = BBOX;
    overlap.right = overlap.left + 8;
    overlap.bottom = overlap.top + 8;
    let before_clips = count_pipe_items(&rig.worker.state, client, |i| {
        matches!(i, PipeItem::StreamClip { .. })
    });
    rig.feed_plain_copy(overlap, now + 10 * MSEC);

    // The stream let go of its frame and the client got a fresh clip.
    assert!(rig.worker.state.streams[0].current.is_none());
    let after_clips = count_pipe_items(&rig.worker.state, client, |i| {
        matches!(i, PipeItem::StreamClip { .. })
    });
    assert!(after_clips > before_clips);
}

#[test]
fn worker_releases_each_command_exactly_once() {
    let mut rig = TestRig::filter_rig();
    let client = rig.attach_default_client();

    rig.feed_copy(BBOX, BASE_TIME);
    // Still referenced by the client pipe.
    assert_eq!(rig.device.released.load(std::sync::atomic::Ordering::SeqCst), 0);

    let frames = rig.worker.drain_client(client);
    assert!(!frames.is_empty());
    assert_eq!(rig.device.released.load(std::sync::atomic::Ordering::SeqCst), 1);
}
