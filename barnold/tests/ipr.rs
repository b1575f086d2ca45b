// End-to-end coverage of the IPR pipeline: a real worker process fed
// through the control channel, streaming tiles back through the shared
// region and waking the redraw thread.
use barnold_lib::models::settings::SessionSetting;
use barnold_lib::services::session::VIEWPORT_CAMERA;
use barnold_lib::{IprError, NodeDelta, ParamValue, Projection, SceneDelta, Session};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

fn use_built_worker() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| std::env::set_var("BARNOLD_WORKER", env!("CARGO_BIN_EXE_barnold-worker")));
}

fn test_settings() -> SessionSetting {
    SessionSetting {
        join_timeout_ms: 5000,
        initial_sampling_level: -1,
        aa_samples: 1,
    }
}

fn initial_scene() -> SceneDelta {
    let mut scene = SceneDelta::default();
    scene.entry("options").set("AA_samples", ParamValue::Int(1));
    *scene.entry(VIEWPORT_CAMERA) = NodeDelta::with_type("persp_camera");
    let mut matrix = [[0.0f32; 4]; 4];
    matrix[0][0] = 1.0;
    matrix[1][1] = 1.0;
    matrix[2][2] = 1.0;
    matrix[3] = [0.0, 0.0, 10.0, 1.0];
    scene
        .entry(VIEWPORT_CAMERA)
        .set("matrix", ParamValue::Matrix(matrix))
        .set("fov", ParamValue::Float(39.6));
    scene
        .entry("options")
        .set("camera", ParamValue::Node(VIEWPORT_CAMERA.to_string()));
    scene
}

#[test]
fn tiles_stream_into_the_shared_buffer() {
    use_built_worker();
    let wakes = Arc::new(AtomicUsize::new(0));
    let observed = wakes.clone();
    let mut session = Session::with_settings(
        test_settings(),
        initial_scene(),
        200,
        150,
        move || {
            observed.fetch_add(1, Ordering::SeqCst);
        },
    )
    .expect("session must start");

    // small viewports render at full resolution
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut lit = false;
    while Instant::now() < deadline {
        let (descriptor, pixels) = session.framebuffer();
        assert_eq!((descriptor.width, descriptor.height), (200, 150));
        if wakes.load(Ordering::SeqCst) > 0 && pixels.iter().any(|&value| value > 0.0) {
            lit = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(lit, "worker never streamed a tile");

    // a live camera move flows through update() as a sparse delta
    let mut moved = [[0.0f32; 4]; 4];
    moved[0][0] = 1.0;
    moved[1][1] = 1.0;
    moved[2][2] = 1.0;
    moved[3] = [4.0, -2.0, 6.0, 1.0];
    let delta = session.track_view(moved, Projection::Perspective { fov: 50.0 });
    assert!(!delta.is_empty());
    let (descriptor, _) = session.update(200, 150, delta).expect("update must succeed");
    assert_eq!((descriptor.width, descriptor.height), (200, 150));

    // an unchanged view produces no delta at all
    assert!(session
        .track_view(moved, Projection::Perspective { fov: 50.0 })
        .is_empty());

    session.stop().expect("stop must succeed");
}

#[test]
fn unchanged_viewport_size_keeps_the_descriptor() {
    use_built_worker();
    let mut session = Session::with_settings(test_settings(), initial_scene(), 1920, 1080, || {})
        .expect("session must start");

    let (first, _) = session
        .update(1920, 1080, SceneDelta::default())
        .expect("update must succeed");
    assert_eq!((first.width, first.height), (686, 386));

    // same requested size: no new region, nothing sent
    let (second, _) = session
        .update(1920, 1080, SceneDelta::default())
        .expect("update must succeed");
    assert_eq!(first, second);

    // a real resize moves to a fresh region, in-band
    let (third, _) = session
        .update(800, 600, SceneDelta::default())
        .expect("update must succeed");
    assert_eq!((third.width, third.height), (514, 386));
    assert_ne!(first.name, third.name);

    session.stop().expect("stop must succeed");
}

#[test]
fn stop_is_terminal_for_the_session() {
    use_built_worker();
    let mut session = Session::with_settings(test_settings(), initial_scene(), 200, 150, || {})
        .expect("session must start");

    session.stop().expect("stop must succeed");
    // idempotent: a second stop is a no-op
    session.stop().expect("second stop must succeed");

    // the worker is never resurrected
    let result = session.update(200, 150, SceneDelta::default());
    assert!(matches!(result, Err(IprError::SessionStopped)));
}
