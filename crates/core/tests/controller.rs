use affect_speaker_core::config::ControllerConfig;
use affect_speaker_core::controller::{Controller, Mode, RunStatus};
use affect_speaker_core::device::{SimulatedDevice, SubjectId};
use affect_speaker_core::sequencer::PhraseTable;
use std::net::{SocketAddr, TcpListener as StdListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const HAPPY: [f32; 5] = [0.1, 0.8, 0.0, 0.0, 0.1];
const SAD: [f32; 5] = [0.0, 0.0, 0.0, 0.1, 0.9];

fn spawn_run(
    controller: Arc<Controller>,
    mode: Mode,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<RunStatus> {
    tokio::spawn(async move { controller.run(mode, cancel).await })
}

#[tokio::test(start_paused = true)]
async fn narration_follows_the_detected_emotion() {
    let device = SimulatedDevice::new();
    device.set_presence(vec![SubjectId(3)]);
    device.set_scores(Some(HAPPY.to_vec()));
    let controller = Arc::new(
        Controller::new(ControllerConfig::default(), Arc::new(device.clone())).unwrap(),
    );
    let cancel = CancellationToken::new();
    let run = spawn_run(
        controller,
        Mode::Narrate {
            text: "Hello there. I am a robot. Nice to meet you".into(),
        },
        cancel.clone(),
    );

    // first sample lands after the 3 s settle delay
    tokio::time::sleep(Duration::from_secs(8)).await;
    device.set_scores(Some(SAD.to_vec()));
    tokio::time::sleep(Duration::from_secs(12)).await;
    cancel.cancel();

    assert_eq!(run.await.unwrap(), RunStatus::Stopped);
    let spoken = device.spoken();
    assert!(spoken[0].contains(r"\vct=100\"), "starts neutral: {}", spoken[0]);
    assert!(spoken.iter().any(|s| s.contains(r"\vct=150\")), "happy pitch used");
    assert!(
        spoken.last().unwrap().contains(r"\vct=80\"),
        "ends sad: {:?}",
        spoken.last()
    );
    assert!(!device.awareness_running());
    assert_eq!(device.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn narration_survives_a_dropped_link() {
    let device = SimulatedDevice::new();
    device.set_presence(vec![]);
    let controller = Arc::new(
        Controller::new(ControllerConfig::default(), Arc::new(device.clone())).unwrap(),
    );
    let cancel = CancellationToken::new();
    let run = spawn_run(
        controller,
        Mode::Narrate {
            text: "Still here. Still talking".into(),
        },
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    device.break_link();
    device.fail_connects(Some(2));
    tokio::time::sleep(Duration::from_secs(15)).await;
    let before_cancel = device.spoken().len();
    cancel.cancel();

    assert_eq!(run.await.unwrap(), RunStatus::Stopped);
    assert!(before_cancel > 4, "kept speaking after reconnect: {before_cancel}");
    assert!(device.connect_attempts() >= 4);
}

fn free_port() -> SocketAddr {
    let probe = StdListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

async fn push_label(addr: SocketAddr, label: &str) {
    for _ in 0..50 {
        if let Ok(mut stream) = TcpStream::connect(addr).await {
            stream.write_all(label.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("receiver never came up on {addr}");
}

#[tokio::test]
async fn story_completes_after_last_phrase() {
    let device = SimulatedDevice::new();
    let addr = free_port();
    let mut config = ControllerConfig::default();
    config.listen_address = addr.to_string();
    config.timing.min_utterance_delay_ms = 0;
    let controller = Arc::new(Controller::new(config, Arc::new(device.clone())).unwrap());
    let phrases = PhraseTable::parse(
        r#"[
            {"neutral": "Once upon a time.", "happy": "Once upon a happy time!"},
            {"neutral": "The end.", "sad": "The sad end."}
        ]"#,
    )
    .unwrap();
    let run = spawn_run(
        controller,
        Mode::Story { phrases },
        CancellationToken::new(),
    );

    push_label(addr, "Happy\n").await;
    push_label(addr, "sad").await;

    let status = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("story finishes")
        .unwrap();
    assert_eq!(status, RunStatus::Completed);
    let spoken = device.spoken();
    assert_eq!(spoken.len(), 2);
    assert!(spoken[0].ends_with("Once upon a happy time!"));
    assert!(spoken[1].ends_with("The sad end."));
    assert_eq!(device.closes(), 1);
}
