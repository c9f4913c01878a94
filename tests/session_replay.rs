use chrono::Local;
use replaykit::backend::{BackendCall, DryRunBackend, Humanized};
use replaykit::config::HumanizeConfig;
use replaykit::key::{ButtonId, KeyIdentifier};
use replaykit::recorder::{KeyAction, RawInput, Recorder, RecorderNotice};
use replaykit::replay::{ReplayState, replay};
use replaykit::sampler::state_at;
use replaykit::storage::{DirectorySink, Session, SessionMetadata, load_event_log, save_session};
use std::time::{Duration, Instant};

fn key(c: char, action: KeyAction) -> RawInput {
    RawInput::Key {
        key: KeyIdentifier::Char(c),
        action,
    }
}

fn button(action: KeyAction) -> RawInput {
    RawInput::Button {
        button: ButtonId::Left,
        action,
    }
}

#[test]
fn recorded_session_replays_in_order() {
    let recorder = Recorder::new(None);
    recorder.start();
    assert_eq!(
        recorder.notices().recv_timeout(Duration::from_secs(1)).unwrap(),
        RecorderNotice::Started
    );

    let t0 = Instant::now();
    let at = |ms| t0 + Duration::from_millis(ms);
    recorder.feed(at(100), key('w', KeyAction::Press));
    recorder.feed(at(150), key('w', KeyAction::Repeat));
    recorder.feed(at(200), RawInput::Motion { dx: 12, dy: -4 });
    recorder.feed(at(300), button(KeyAction::Press));
    recorder.feed(at(400), button(KeyAction::Release));
    recorder.feed(at(500), key('w', KeyAction::Release));
    let log = recorder.finish();
    assert_eq!(log.len(), 5);

    let w = KeyIdentifier::Char('w');
    let held = state_at(&log, log.events()[2].timestamp);
    assert!(held.pressed_keys.contains(&w));
    assert!(held.pressed_buttons.contains(&ButtonId::Left));
    assert_eq!(held.pointer_position, (12, -4));

    let root = tempfile::tempdir().unwrap();
    let session = Session::new(log, 30, Local::now());
    let dir = root.path().join(session.default_name());
    let mut sink = DirectorySink::create(&dir).unwrap();
    let metadata = SessionMetadata::new(&session, None, "libx264");
    save_session(&mut sink, &session, &metadata).unwrap();

    let loaded = load_event_log(&dir).unwrap();
    let mut backend = DryRunBackend::new();
    let report = replay(&loaded, &mut backend, 4.0, 0.0).unwrap();

    assert_eq!(report.state, ReplayState::Completed);
    assert_eq!(report.dispatched, 5);
    assert_eq!(
        backend.calls(),
        vec![
            BackendCall::KeyDown(w),
            BackendCall::PointerMove(12, -4),
            BackendCall::PointerDown(ButtonId::Left),
            BackendCall::PointerUp(ButtonId::Left),
            BackendCall::KeyUp(w),
        ]
    );
}

#[test]
fn humanized_replay_leaves_nothing_held() {
    let w = KeyIdentifier::Char('w');
    let log = replaykit::EventLog::from_events(vec![
        replaykit::InputEvent::key_press(0.0, w),
        replaykit::InputEvent::pointer_press(0.01, ButtonId::Right, (0, 0)),
        replaykit::InputEvent::pointer_move(0.02, 90, 0, 90, 0),
    ])
    .unwrap();

    let dry = DryRunBackend::new();
    let calls = dry.call_log();
    let mut backend = Humanized::new(dry, HumanizeConfig::default())
        .with_seed(11)
        .with_sleep(|_| {});
    replay(&log, &mut backend, 1.0, 0.0).unwrap();

    let calls: Vec<BackendCall> = calls.lock().iter().map(|c| c.call.clone()).collect();
    let downs = calls
        .iter()
        .filter(|c| matches!(c, BackendCall::KeyDown(_) | BackendCall::PointerDown(_)))
        .count();
    let ups = calls
        .iter()
        .filter(|c| matches!(c, BackendCall::KeyUp(_) | BackendCall::PointerUp(_)))
        .count();
    assert_eq!(downs, 2);
    assert_eq!(ups, 2);
    // 90px split into 6 sub-moves
    let moves = calls
        .iter()
        .filter(|c| matches!(c, BackendCall::PointerMove(..)))
        .count();
    assert_eq!(moves, 6);
}
