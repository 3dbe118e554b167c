//! End-to-end session tests against fake decoders and devices

use bytes::Bytes;
use castsink_io::{ManualClock, MediaClock, SystemClock};
use castsink_render::{
    AccessUnit, MediaFormat, RenderError, SessionHandle, SinkSession, VideoSchedulerConfig,
    VideoSink, AUDIO_TRACK, DECODER_RETRY_DELAY, VIDEO_TRACK,
};
use castsink_tests::{recorder, FakeBackend, Recorder, FAKE_SAMPLE_RATE};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn session_with<C: MediaClock>(clock: C, recorder: &Recorder) -> SinkSession<C> {
    let surface: Arc<dyn VideoSink> = recorder.surface.clone();
    SinkSession::new(
        clock,
        Box::new(FakeBackend::new(recorder.clone())),
        surface,
        VideoSchedulerConfig::default(),
    )
}

fn configure(handle: &SessionHandle) {
    handle
        .set_format(VIDEO_TRACK, MediaFormat::video("video/avc", 1280, 720))
        .unwrap();
    handle
        .set_format(AUDIO_TRACK, MediaFormat::audio("audio/raw", FAKE_SAMPLE_RATE, 2))
        .unwrap();
}

fn pcm(index: u8, len: usize) -> Bytes {
    Bytes::from(vec![index; len])
}

#[test]
fn test_audio_paced_within_ring() {
    let clock = ManualClock::default();
    let recorder = recorder();
    let mut session = session_with(clock.clone(), &recorder);
    let handle = session.mailbox();
    configure(&handle);

    // 10 buffers of 240 frames (5 ms each) against a 480 frame ring
    let mut expected = Vec::new();
    for i in 0..10u8 {
        let payload = pcm(i, 960);
        expected.extend_from_slice(&payload);
        handle
            .queue_access_unit(AUDIO_TRACK, AccessUnit::new(i as i64 * 5_000, payload))
            .unwrap();
    }
    session.drain_mailbox().unwrap();
    assert_eq!(recorder.audio.lock().frames_written, 480);

    for _ in 0..200 {
        clock.advance_us(1_000);
        recorder.audio.lock().play(48);
        session.drain_mailbox().unwrap();
        if recorder.audio.lock().written.len() == expected.len() {
            break;
        }
    }

    let audio = recorder.audio.lock();
    assert_eq!(audio.written, expected);
    assert!(audio.max_in_flight <= 480);
    assert_eq!(session.stats().audio_bytes_written, expected.len() as u64);
    assert_eq!(session.stats().access_units, 10);
    drop(audio);
    assert_eq!(recorder.outstanding(AUDIO_TRACK), 0);
}

#[test]
fn test_video_presented_on_deadline() {
    let clock = ManualClock::default();
    let recorder = recorder();
    let mut session = session_with(clock.clone(), &recorder);
    let handle = session.mailbox();
    configure(&handle);

    for (i, pts) in [10_000i64, 20_000, 30_000].into_iter().enumerate() {
        handle
            .queue_access_unit(VIDEO_TRACK, AccessUnit::new(pts, pcm(i as u8, 100)))
            .unwrap();
    }
    session.drain_mailbox().unwrap();
    assert!(recorder.presented().is_empty());
    assert_eq!(session.next_timer_due_us(), Some(10_000));

    clock.set_now_us(10_000);
    session.drain_mailbox().unwrap();
    assert_eq!(recorder.presented().len(), 1);

    // 30 ms and 20 ms past their deadlines
    clock.set_now_us(50_000);
    session.drain_mailbox().unwrap();

    let presented = recorder.presented();
    let pts: Vec<i64> = presented.iter().map(|(pts, _)| *pts).collect();
    assert_eq!(pts, vec![10_000, 20_000, 30_000]);
    assert_eq!(presented[2].1, pcm(2, 100));

    let stats = session.stats();
    assert_eq!(stats.video_frames, 3);
    assert_eq!(stats.video_frames_late, 2);
    assert_eq!(recorder.outstanding(VIDEO_TRACK), 0);
}

#[test]
fn test_shutdown_returns_held_outputs_first() {
    let clock = ManualClock::default();
    let recorder = recorder();
    let mut session = session_with(clock.clone(), &recorder);
    let handle = session.mailbox();
    configure(&handle);

    // Video frames far in the future, audio beyond what the ring holds
    for i in 0..3u8 {
        handle
            .queue_access_unit(
                VIDEO_TRACK,
                AccessUnit::new(1_000_000 + i as i64 * 33_000, pcm(i, 10)),
            )
            .unwrap();
    }
    for i in 0..6u8 {
        handle
            .queue_access_unit(AUDIO_TRACK, AccessUnit::new(i as i64 * 5_000, pcm(i, 960)))
            .unwrap();
    }
    session.drain_mailbox().unwrap();
    assert_eq!(recorder.outstanding(VIDEO_TRACK), 3);
    assert!(recorder.outstanding(AUDIO_TRACK) > 0);

    handle.shutdown().unwrap();
    session.drain_mailbox().unwrap();
    assert!(session.is_stopped());

    assert_eq!(recorder.outstanding(VIDEO_TRACK), 0);
    assert_eq!(recorder.outstanding(AUDIO_TRACK), 0);
    assert!(recorder.presented().is_empty());

    let journal = recorder.journal();
    let position = |entry: &str| journal.iter().position(|e| e == entry).unwrap();
    let last_return = journal
        .iter()
        .rposition(|e| e.contains("release_output"))
        .unwrap();

    assert!(last_return < position("track0 stop"));
    assert!(position("track0 stop") < position("track0 release"));
    assert!(position("track1 stop") < position("track1 release"));
    assert_eq!(
        &journal[journal.len() - 2..],
        &["audio stop".to_string(), "surface stop".to_string()]
    );
    assert!(recorder.audio.lock().stopped);

    // Idempotent
    session.teardown().unwrap();
    assert_eq!(recorder.journal().len(), journal.len());
}

#[test]
fn test_run_until_shutdown() {
    let recorder = recorder();
    let clock = SystemClock::new();
    let session = session_with(clock, &recorder);
    let handle = session.mailbox();
    let stats = session.stats_handle();

    let runner = thread::spawn(move || session.run());

    // Rejected on its own; the session keeps running
    handle
        .queue_access_unit(7, AccessUnit::new(0, pcm(0, 1)))
        .unwrap();
    configure(&handle);
    let start = clock.now_us();
    for (i, delay) in [5_000i64, 15_000].into_iter().enumerate() {
        handle
            .queue_access_unit(VIDEO_TRACK, AccessUnit::new(start + delay, pcm(i as u8, 16)))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.presented().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    handle.shutdown().unwrap();
    let final_stats = runner.join().unwrap().unwrap();

    assert_eq!(final_stats.video_frames, 2);
    assert_eq!(stats.lock().video_frames, 2);
    assert!(recorder.journal().contains(&"surface stop".to_string()));
    assert!(handle.shutdown().is_err());
}

#[test]
fn test_busy_decoder_retried_without_new_input() {
    let clock = ManualClock::default();
    let recorder = recorder();
    let mut session = session_with(clock.clone(), &recorder);
    let handle = session.mailbox();
    configure(&handle);

    recorder.faults.lock().busy_queues = 2;
    handle
        .queue_access_unit(VIDEO_TRACK, AccessUnit::new(100_000, pcm(7, 32)))
        .unwrap();
    session.drain_mailbox().unwrap();

    let queued = |recorder: &Recorder| recorder.decoders.lock()[&VIDEO_TRACK].queued.clone();
    assert!(queued(&recorder).is_empty());
    let retry_us = DECODER_RETRY_DELAY.as_micros() as i64;
    assert_eq!(session.next_timer_due_us(), Some(retry_us));

    // The unit reaches the decoder from retries alone
    clock.advance(DECODER_RETRY_DELAY);
    session.drain_mailbox().unwrap();
    assert!(queued(&recorder).is_empty());
    clock.advance(DECODER_RETRY_DELAY);
    session.drain_mailbox().unwrap();
    assert_eq!(queued(&recorder), vec![100_000]);

    clock.set_now_us(100_000);
    session.drain_mailbox().unwrap();
    assert_eq!(recorder.presented(), vec![(100_000, pcm(7, 32))]);
}

#[test]
fn test_deferred_render_retried() {
    let clock = ManualClock::default();
    let recorder = recorder();
    let mut session = session_with(clock.clone(), &recorder);
    let handle = session.mailbox();
    configure(&handle);
    handle
        .queue_access_unit(VIDEO_TRACK, AccessUnit::new(10_000, pcm(1, 8)))
        .unwrap();
    session.drain_mailbox().unwrap();

    recorder.faults.lock().deferred_returns = 1;
    clock.set_now_us(10_000);
    session.drain_mailbox().unwrap();
    assert!(recorder.presented().is_empty());
    assert_eq!(recorder.outstanding(VIDEO_TRACK), 1);

    clock.advance(DECODER_RETRY_DELAY);
    session.drain_mailbox().unwrap();
    assert_eq!(recorder.presented().len(), 1);
    assert_eq!(recorder.outstanding(VIDEO_TRACK), 0);
    assert_eq!(session.stats().video_frames, 1);
}

#[test]
fn test_decoder_fault_ends_session() {
    let clock = ManualClock::default();
    let recorder = recorder();
    let mut session = session_with(clock.clone(), &recorder);
    let handle = session.mailbox();
    configure(&handle);

    recorder.faults.lock().failing_track = Some(VIDEO_TRACK);
    handle
        .queue_access_unit(VIDEO_TRACK, AccessUnit::new(0, pcm(0, 8)))
        .unwrap();

    let err = session.drain_mailbox().unwrap_err();
    assert!(matches!(err, RenderError::DecoderFault { track: VIDEO_TRACK, .. }));
    assert!(err.is_fatal());
    assert!(session.is_stopped());

    let journal = recorder.journal();
    for entry in ["track0 stop", "track0 release", "audio stop", "surface stop"] {
        assert!(journal.contains(&entry.to_string()), "missing {}", entry);
    }

    // Later messages never reach the faulted decoder
    handle
        .queue_access_unit(VIDEO_TRACK, AccessUnit::new(1, pcm(1, 8)))
        .unwrap();
    session.drain_mailbox().unwrap();
    assert_eq!(recorder.decoders.lock()[&VIDEO_TRACK].queue_attempts, 1);
}

#[test]
fn test_run_ends_on_decoder_fault() {
    let recorder = recorder();
    recorder.faults.lock().failing_track = Some(VIDEO_TRACK);
    let session = session_with(SystemClock::new(), &recorder);
    let handle = session.mailbox();

    let runner = thread::spawn(move || session.run());
    configure(&handle);
    handle
        .queue_access_unit(VIDEO_TRACK, AccessUnit::new(0, pcm(0, 8)))
        .unwrap();

    let result = runner.join().unwrap();
    assert!(matches!(result, Err(RenderError::DecoderFault { .. })));
    assert!(recorder.journal().contains(&"surface stop".to_string()));
}
