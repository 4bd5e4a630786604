//! DAWN - a voice-interactive assistant daemon.
//!
//! Captures microphone audio, detects a wake phrase, records and
//! transcribes the spoken command, routes it through the action table or an
//! LLM (with tool-call loopback over MQTT), and speaks the reply. A TCP
//! gateway accepts WAV uploads from remote clients and answers with
//! synthesized audio.

mod audio;
mod bus;
mod config;
mod dispatch;
mod llm;
mod net;
mod state;
mod stt;
mod tts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use parking_lot::Mutex;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use bus::MqttBus;
use config::{ActionsFile, Cli, DispatchMode, LlmBackendKind, Settings};
use dispatch::handlers::{
    BackendHandler, CaptureDeviceHandler, ClockHandler, PlaybackDeviceHandler, RelayHandler, ShutdownHandler, SpeakHandler, ViewingHandler,
    VolumeHandler,
};
use dispatch::{ActionRouter, CaptureSwitch, CommandDispatcher, HandlerRegistry, InboundRouter, PendingTools, VisionSlot};
use llm::{ConversationHistory, LlmRouter};
use net::{GatewayConfig, RendezvousSlot};
use state::{ControlDeps, Orchestrator, PhraseTables};
use stt::WhisperTranscriber;
use tts::{SpeechOutput, Synthesizer};

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| if cli.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })
        .unwrap();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")));

    match &cli.logfile {
        Some(path) => {
            let file = std::fs::File::create(path).with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// System prompt. LLM-backed modes get the tool-call instructions; pure
/// direct mode keeps the model conversational only.
fn system_prompt(mode: DispatchMode, ai_name: &str) -> String {
    let base = format!(
        "You are {ai_name}, a helpful voice assistant. Keep responses brief and conversational, \
         maximum two or three short sentences. Use plain spoken language: no emojis, no markdown, \
         no bullet points."
    );
    if mode == DispatchMode::DirectOnly {
        return base;
    }
    format!(
        "{base} You can control devices by emitting a command block such as \
         <command>{{\"device\":\"lights\",\"action\":\"on\",\"value\":\"kitchen\"}}</command>. \
         Known devices include lights, music, volume, text_to_speech, time, date, viewing and shutdown. \
         After a command completes you will receive its result as a tool message; summarize it for the user."
    )
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    info!("DAWN daemon v{}", env!("CARGO_PKG_VERSION"));

    let settings_path = cli.config.clone().unwrap_or_else(config::default_settings_path);
    let mut settings = Settings::load(&settings_path)?;

    let actions_path = cli.actions.clone().unwrap_or_else(config::default_actions_path);
    let actions = ActionsFile::load(&actions_path)?;

    // CLI wins over the settings file.
    if cli.network_audio {
        settings.network.enabled = true;
    }
    if let Some(mode) = cli.dispatch_mode() {
        settings.dispatch.mode = mode;
    }
    let mode = settings.dispatch.mode;
    let backend = cli.llm.unwrap_or_default();
    let provider = cli.cloud_provider.unwrap_or_default();

    // Logical device names resolve through the configured tables; a name
    // that is not listed is a configuration error.
    let capture_id = match &cli.capture {
        Some(name) => Some(actions.find_capture(name).with_context(|| format!("unknown capture device \"{name}\""))?.id.clone()),
        None => None,
    };
    let playback_id = match &cli.playback {
        Some(name) => Some(actions.find_playback(name).with_context(|| format!("unknown playback device \"{name}\""))?.id.clone()),
        None => None,
    };

    let quit = Arc::new(AtomicBool::new(false));
    let own_topic = actions.ai_name.to_lowercase();

    // --- speech output -----------------------------------------------------
    let synthesizer = Arc::new(Mutex::new(Synthesizer::new(&settings.tts)?));
    let speech = Arc::new(SpeechOutput::start(synthesizer.clone(), playback_id)?);

    // --- LLM ---------------------------------------------------------------
    let llm = Arc::new(LlmRouter::new(&settings.llm, backend, provider)?);
    let history = Arc::new(Mutex::new(ConversationHistory::new(system_prompt(mode, &actions.ai_name))));
    let pending = Arc::new(PendingTools::new());

    // --- shared control state ---------------------------------------------
    let vision = Arc::new(VisionSlot::new());
    let capture_switch = Arc::new(CaptureSwitch::new());

    // --- MQTT bus ----------------------------------------------------------
    // The event-loop callback and the handler registry reference each
    // other; the cell breaks the cycle.
    let inbound_cell: Arc<OnceLock<Arc<InboundRouter>>> = Arc::new(OnceLock::new());
    let bus = if settings.mqtt.enabled {
        let cell = inbound_cell.clone();
        let bus = MqttBus::connect(&settings.mqtt.host, settings.mqtt.port, settings.mqtt.keep_alive_secs, &own_topic, move |payload| {
            if let Some(router) = cell.get() {
                router.route(payload);
            }
        })
        .context("MQTT broker connection failed")?;
        Some(Arc::new(bus))
    } else {
        info!("MQTT disabled; device actions stay local");
        None
    };

    // --- device handlers ---------------------------------------------------
    let mut registry = HandlerRegistry::new();
    registry.register("time", Box::new(ClockHandler));
    registry.register("date", Box::new(ClockHandler));
    registry.register("volume", Box::new(VolumeHandler { speech: speech.clone() }));
    registry.register("text_to_speech", Box::new(SpeakHandler { speech: speech.clone() }));
    registry.register("shutdown", Box::new(ShutdownHandler { quit: quit.clone() }));
    registry.register("viewing", Box::new(ViewingHandler { vision: vision.clone() }));
    registry.register("local_llm", Box::new(BackendHandler { router: llm.clone(), kind: LlmBackendKind::Local }));
    registry.register("cloud_llm", Box::new(BackendHandler { router: llm.clone(), kind: LlmBackendKind::Cloud }));
    registry.register(
        "audio_capture_device",
        Box::new(CaptureDeviceHandler { switch: capture_switch.clone(), table: actions.capture_devices.clone() }),
    );
    registry.register(
        "audio_playback_device",
        Box::new(PlaybackDeviceHandler { speech: speech.clone(), table: actions.playback_devices.clone() }),
    );
    registry.register("music", Box::new(RelayHandler { bus: bus.clone(), device: "music".into(), topic: "music".into() }));
    registry.register(
        "voice_amplifier",
        Box::new(RelayHandler { bus: bus.clone(), device: "voice_amplifier".into(), topic: "voice_amplifier".into() }),
    );

    let inbound = Arc::new(InboundRouter { registry, pending: pending.clone(), speech: speech.clone() });
    let _ = inbound_cell.set(inbound.clone());

    // --- dispatcher --------------------------------------------------------
    let dispatcher = CommandDispatcher::new(
        mode,
        ActionRouter::compile(&actions.actions)?,
        llm.clone(),
        history.clone(),
        pending.clone(),
        bus.clone(),
        inbound,
        own_topic.clone(),
        settings.dispatch.clone(),
    );

    // --- network gateway ---------------------------------------------------
    let slot = if settings.network.enabled {
        let slot = Arc::new(RendezvousSlot::new());
        let gateway_config = GatewayConfig {
            network: settings.network.clone(),
            busy_reply: settings.dispatch.busy_reply.clone(),
            error_reply: "I couldn't understand that audio format.".to_string(),
        };
        net::gateway::spawn(gateway_config, slot.clone(), synthesizer.clone(), quit.clone())?;
        Some(slot)
    } else {
        None
    };

    // --- control thread ----------------------------------------------------
    let deps = ControlDeps {
        listen: settings.listen.clone(),
        network: settings.network.clone(),
        phrases: PhraseTables::build(&actions.ai_name, &settings.dispatch),
        speech: speech.clone(),
        dispatcher,
        bus: bus.clone(),
        slot,
        vision,
        capture_switch,
        history: history.clone(),
        quit: quit.clone(),
        ai_name: actions.ai_name.clone(),
        greeting_reply: settings.dispatch.greeting_reply.clone(),
        farewell_reply: settings.dispatch.farewell_reply.clone(),
        busy_reply: settings.dispatch.busy_reply.clone(),
    };

    let stt_settings = settings.stt.clone();
    let (done_tx, done_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
    let control_quit = quit.clone();

    // The capture stream and the recognizer both live on the control
    // thread; they are created there, not moved there.
    std::thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            let result = (|| -> Result<()> {
                let transcriber = Box::new(WhisperTranscriber::new(&stt_settings)?);
                let orchestrator = Orchestrator::new(deps, capture_id.as_deref(), transcriber)?;
                orchestrator.run()
            })();
            if result.is_err() {
                control_quit.store(true, Ordering::SeqCst);
            }
            let _ = done_tx.send(result);
        })
        .context("failed to spawn control thread")?;

    // --- signal handling ---------------------------------------------------
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let exit_code = runtime.block_on(async {
        let control_done = watch_control(done_rx);
        tokio::pin!(control_done);

        tokio::select! {
            _ = wait_for_signal() => {
                info!("Shutdown signal received");
                quit.store(true, Ordering::SeqCst);
                // Give the control thread a chance to say goodbye and
                // persist the conversation.
                match tokio::time::timeout(std::time::Duration::from_secs(10), &mut control_done).await {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => { error!("Control thread failed: {:#}", e); 1 }
                    Err(_) => { error!("Control thread did not stop in time"); 1 }
                }
            }
            result = &mut control_done => {
                match result {
                    Ok(()) => 0,
                    Err(e) => { error!("Control thread failed: {:#}", e); 1 }
                }
            }
        }
    });

    debug!("Daemon exiting with code {}", exit_code);
    Ok(exit_code)
}

async fn watch_control(rx: std::sync::mpsc::Receiver<Result<()>>) -> Result<()> {
    tokio::task::spawn_blocking(move || rx.recv().unwrap_or_else(|_| bail!("control thread vanished without reporting")))
        .await
        .context("control watcher failed")?
}

async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("❌ Startup failed: {:#}", e);
            eprintln!("dawnd: {e:#}");
            std::process::exit(1);
        }
    }
}
