//! Whole-service tests: real subsystems under a `Toplevel`, synthetic frames.

use std::time::Duration;

use clap::Parser;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use watchpost_server::camera::SourceTier;
use watchpost_server::error::ServiceError;
use watchpost_server::{Cli, Surveillance};

fn args(tmp: &TempDir, extra: &[&str]) -> Cli {
    let mut argv = vec![
        "watchpost",
        "--rpicam-command",
        "/nonexistent/rpicam-vid",
        "--device",
        "/nonexistent/video9",
        "--width",
        "160",
        "--height",
        "120",
        "--fps",
        "25",
        "--recordings-dir",
        tmp.path().to_str().unwrap(),
    ];
    argv.extend_from_slice(extra);
    Cli::parse_from(argv)
}

/// Start the services, run `check` as one more subsystem, shut down when it
/// returns and hand back its result.
async fn with_service<T, F, Fut>(args: Cli, check: F) -> T
where
    T: Send + 'static,
    F: FnOnce(Surveillance) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
{
    let (surveillance, services) = Surveillance::new(&args).unwrap();
    let (tx, rx) = oneshot::channel();

    Toplevel::new(move |s| async move {
        services.start(&s);
        s.start(SubsystemBuilder::new("Check", move |sub: SubsystemHandle| async move {
            let result = check(surveillance).await;
            let _ = tx.send(result);
            sub.request_shutdown();
            Ok::<(), ServiceError>(())
        }));
    })
    .handle_shutdown_requests(Duration::from_secs(10))
    .await
    .unwrap();

    rx.await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_hardware_falls_back_to_synthetic() {
    let tmp = TempDir::new().unwrap();
    let (surveillance, _services) = Surveillance::new(&args(&tmp, &[])).unwrap();
    // Nothing captured yet: defined empty answer, immediately
    assert!(surveillance.latest_frame().is_none());

    let (frame, status) = with_service(args(&tmp, &[]), |s| async move {
        let started = Instant::now();
        let frame = loop {
            if let Some(frame) = s.latest_frame() {
                break frame;
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            sleep(Duration::from_millis(10)).await;
        };
        (frame, s.status().await)
    })
    .await;

    assert!(!frame.is_empty());
    assert_eq!((frame.width, frame.height), (160, 120));
    assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
    assert_eq!(status.camera.tier, Some(SourceTier::Synthetic));
    assert!(status.camera.degraded);
    assert!(status.camera.last_error.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_subscriber_does_not_slow_capture() {
    let tmp = TempDir::new().unwrap();
    let cli = args(&tmp, &["--camera", "synthetic", "--subscriber-buffer", "4"]);

    let (captured, buffered, dropped) = with_service(cli, |s| async move {
        let mut stalled = s.hub().subscribe();
        let mut status = s.hub().watch_status();
        let from = status.borrow().frames_captured;
        timeout(
            Duration::from_secs(10),
            status.wait_for(|st| st.frames_captured >= from + 20),
        )
        .await
        .unwrap()
        .unwrap();

        let mut buffered = 0;
        while stalled.try_recv().is_some() {
            buffered += 1;
        }
        (s.hub().status().frames_captured, buffered, stalled.dropped())
    })
    .await;

    assert!(captured >= 20);
    assert!(buffered <= 4);
    assert!(dropped >= 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_manual_recording_is_registered() {
    let tmp = TempDir::new().unwrap();
    let cli = args(&tmp, &["--camera", "synthetic"]);

    let days = with_service(cli, |s| async move {
        s.start_recording(Some(Duration::from_secs(1))).await.unwrap();
        timeout(Duration::from_secs(10), async {
            while s.status().await.recording.state != "idle" {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        s.list_videos().await
    })
    .await;

    assert_eq!(days.len(), 1);
    let recording = &days[0].recordings[0];
    assert!(recording.filename.starts_with("manual_"));
    assert!(recording.frame_count > 0);
    assert!(recording.complete);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_finalizes_active_session() {
    let tmp = TempDir::new().unwrap();
    let cli = args(&tmp, &["--camera", "synthetic", "--motion"]);

    with_service(cli, |s| async move {
        s.simulate_motion().unwrap();
        timeout(Duration::from_secs(10), async {
            while s.status().await.recording.frame_count < 3 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    })
    .await;

    let (surveillance, _services) = Surveillance::new(&args(&tmp, &[])).unwrap();
    let days = surveillance.list_videos().await;
    assert_eq!(days.len(), 1);
    assert!(days[0].recordings[0].filename.starts_with("motion_"));
    assert!(days[0].recordings[0].frame_count >= 3);
}
