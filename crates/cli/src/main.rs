#![deny(warnings)]

use affect_speaker_core::config::{
    load_config_file, resolve_device_address, resolve_optional_string, ControllerConfig, Env,
    StdEnv, ENV_CONFIG_PATH, ENV_LISTEN_ADDRESS,
};
use affect_speaker_core::controller::{Controller, Mode, RunStatus};
use affect_speaker_core::device::{
    BridgeSessionFactory, SessionFactory, SimulatedDevice, SubjectId,
};
use affect_speaker_core::emotion::EmotionClass;
use affect_speaker_core::sequencer::PhraseTable;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

const ENV_BRIDGE_URL: &str = "AFFECT_BRIDGE_URL";
const SIMULATED_SPEECH: Duration = Duration::from_millis(1_200);

const DEMO_TEXT: &str = "Hello, my name is Pepper. I am very happy to meet you today. \
    Let me tell you a little about myself. I like to talk with people. \
    I can see how you feel, and I try to speak the way you do.";

const DEMO_PHRASES: &str = r#"[
    {"neutral": "Once upon a time there was a small robot.",
     "happy": "Once upon a time there was a small and very cheerful robot!",
     "sad": "Once upon a time there was a small, lonely robot."},
    {"neutral": "Every day it walked to the sea.",
     "surprised": "Every day, to everyone's surprise, it walked all the way to the sea!",
     "angry": "Every single day it had to walk to the sea."},
    {"neutral": "One morning it found a friend on the beach.",
     "happy": "One morning it found a wonderful friend on the beach!",
     "sad": "One grey morning it found a friend on the beach."},
    {"neutral": "And from then on it never walked alone."}
]"#;

#[derive(Parser, Debug)]
#[command(name = "affect-speaker")]
#[command(about = "Emotion-adaptive speech and gesture controller for a social robot")]
struct Args {
    /// JSON file with controller settings.
    #[arg(long, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    #[arg(long)]
    device_address: Option<String>,

    /// Base URL of the device bridge.
    #[arg(long, env = ENV_BRIDGE_URL, conflicts_with = "simulate")]
    bridge_url: Option<String>,

    /// Run against an in-process simulated robot.
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repeat a text, adapting voice and gestures to the person in front of the robot.
    Narrate {
        #[arg(long, conflicts_with = "text_file")]
        text: Option<String>,

        #[arg(long)]
        text_file: Option<PathBuf>,
    },
    /// Tell a story whose pace and tone follow emotion labels pushed over TCP.
    Story {
        /// JSON phrase table; a short demo story is used when omitted.
        #[arg(long)]
        phrases: Option<PathBuf>,

        #[arg(long)]
        listen: Option<String>,
    },
    /// Print the resolved configuration as JSON and exit.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let config = build_config(&args, &env)?;

    if matches!(args.command, Command::Config) {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let factory = build_factory(&args, &config, &env)?;
    let mode = build_mode(args.command)?;
    tracing::info!(
        device = %config.device_address,
        classes = config.classes.len(),
        simulate = args.simulate,
        "config loaded"
    );

    let controller = Controller::new(config, factory).context("invalid configuration")?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            tracing::info!("stop requested");
            cancel.cancel();
        });
    }

    match controller.run(mode, cancel).await {
        RunStatus::Stopped => tracing::info!("stopped by user"),
        RunStatus::Completed => tracing::info!("story complete"),
        RunStatus::Faulted(e) => return Err(e).context("controller fault"),
    }
    Ok(())
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Flags win over environment variables, which win over the config file.
fn build_config(args: &Args, env: &impl Env) -> anyhow::Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    config.device_address =
        resolve_device_address(args.device_address.clone(), env, &config.device_address)?;

    let cli_listen = match &args.command {
        Command::Story { listen, .. } => listen.clone(),
        _ => None,
    };
    if let Some(listen) = resolve_optional_string(cli_listen, ENV_LISTEN_ADDRESS, env) {
        config.listen_address = listen;
    }

    config.validate()?;
    Ok(config)
}

fn build_factory(
    args: &Args,
    config: &ControllerConfig,
    env: &impl Env,
) -> anyhow::Result<Arc<dyn SessionFactory>> {
    if args.simulate {
        return Ok(Arc::new(simulated_device(config)));
    }
    let raw = resolve_optional_string(args.bridge_url.clone(), ENV_BRIDGE_URL, env)
        .context("--bridge-url (or --simulate) is required to reach a robot")?;
    let base_url = Url::parse(&raw).with_context(|| format!("invalid --bridge-url: {raw}"))?;
    let factory = BridgeSessionFactory::new(
        base_url,
        config.timing.bridge_request_timeout(),
        config.timing.speech_wait_timeout(),
    )?;
    Ok(Arc::new(factory))
}

/// One person in view whose expression cycles through a few emotions.
fn simulated_device(config: &ControllerConfig) -> SimulatedDevice {
    let device = SimulatedDevice::new().with_speech_duration(SIMULATED_SPEECH);
    device.set_presence(vec![SubjectId(1)]);
    let script = [
        EmotionClass::Neutral,
        EmotionClass::Happy,
        EmotionClass::Happy,
        EmotionClass::Surprised,
        EmotionClass::Sad,
    ]
    .into_iter()
    .filter_map(|class| {
        let hot = config.classes.position(class)?;
        Some(Some(
            (0..config.classes.len())
                .map(|i| if i == hot { 0.9 } else { 0.05 })
                .collect(),
        ))
    })
    .collect();
    device.script_scores(script);
    device
}

fn build_mode(command: Command) -> anyhow::Result<Mode> {
    match command {
        Command::Narrate { text, text_file } => {
            let text = match (text, text_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => DEMO_TEXT.to_owned(),
            };
            Ok(Mode::Narrate { text })
        }
        Command::Story { phrases, .. } => {
            let phrases = match phrases {
                Some(path) => PhraseTable::load(&path)?,
                None => PhraseTable::parse(DEMO_PHRASES)?,
            };
            Ok(Mode::Story { phrases })
        }
        Command::Config => anyhow::bail!("config does not run the controller"),
    }
}
