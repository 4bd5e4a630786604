//! Network audio gateway.
//!
//! Accepts framed WAV uploads over TCP, hands the PCM to the state machine
//! through the rendezvous slot, and frames the synthesized reply back.
//! One accept thread; one short-lived worker per connection with a
//! per-session socket timeout.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::audio::wav;
use crate::config::NetworkSettings;
use crate::tts::Synthesizer;

use super::protocol::{self, ProtocolError};
use super::rendezvous::{NetworkRequest, RendezvousSlot};

pub struct GatewayConfig {
    pub network: NetworkSettings,
    pub busy_reply: String,
    pub error_reply: String,
}

/// Spawn the accept thread. Workers are detached; they die with their
/// sockets when the process exits.
pub fn spawn(
    config: GatewayConfig,
    slot: Arc<RendezvousSlot>,
    synthesizer: Arc<Mutex<Synthesizer>>,
    quit: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", config.network.port)).with_context(|| format!("failed to bind TCP port {}", config.network.port))?;
    listener.set_nonblocking(true).context("failed to make the listener non-blocking")?;
    info!("Network audio gateway listening on port {}", config.network.port);

    let config = Arc::new(config);

    let handle = std::thread::Builder::new()
        .name("net-gateway".into())
        .spawn(move || {
            loop {
                if quit.load(Ordering::Relaxed) {
                    debug!("Gateway accept loop exiting");
                    return;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        info!("Network audio client connected: {}", peer);
                        let config = config.clone();
                        let slot = slot.clone();
                        let synthesizer = synthesizer.clone();
                        let _ = std::thread::Builder::new().name(format!("net-client-{peer}")).spawn(move || {
                            if let Err(e) = handle_client(stream, &peer.to_string(), &config, &slot, &synthesizer) {
                                warn!("Session with {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        std::thread::sleep(Duration::from_millis(500));
                    }
                }
            }
        })
        .context("failed to spawn gateway thread")?;

    Ok(handle)
}

/// Render `text` as a reply WAV. Synthesis failures degrade to an empty
/// (but well-formed) WAV so the client still gets a framed response.
fn synthesize_reply(synthesizer: &Mutex<Synthesizer>, text: &str) -> Vec<u8> {
    match synthesizer.lock().synthesize_to_wav(text) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Reply synthesis failed: {}", e);
            wav::build(&[], crate::audio::PIPELINE_SAMPLE_RATE)
        }
    }
}

fn handle_client(
    mut stream: TcpStream,
    peer: &str,
    config: &GatewayConfig,
    slot: &RendezvousSlot,
    synthesizer: &Mutex<Synthesizer>,
) -> Result<(), ProtocolError> {
    let session_timeout = Duration::from_secs(config.network.session_timeout_secs);
    stream.set_read_timeout(Some(session_timeout))?;
    stream.set_write_timeout(Some(session_timeout))?;

    let upload = protocol::recv_message(&mut stream, config.network.max_retries)?;
    debug!("Received {} bytes from {}", upload.len(), peer);

    // Reject anything that is not pipeline-format PCM before it gets near
    // the recognizer.
    let audio = match wav::parse_pipeline(&upload) {
        Ok(audio) => audio,
        Err(e) => {
            warn!("Rejecting upload from {}: {}", peer, e);
            let reply = synthesize_reply(synthesizer, &config.error_reply);
            return protocol::send_message(&mut stream, &reply, config.network.max_retries);
        }
    };

    let request = NetworkRequest { pcm: audio.pcm, sample_rate: audio.sample_rate, client: peer.to_string() };
    if slot.submit(request).is_err() {
        info!("Slot busy, turning {} away", peer);
        let reply = synthesize_reply(synthesizer, &config.busy_reply);
        return protocol::send_message(&mut stream, &reply, config.network.max_retries);
    }

    let response_timeout = Duration::from_secs(config.network.response_timeout_secs);
    let reply = match slot.wait_result(response_timeout) {
        Some(bytes) => bytes,
        None => {
            // The state machine never answered; echo the original audio so
            // the client at least hears something.
            warn!("Reply timeout for {}, echoing the upload", peer);
            upload
        }
    };

    let reply = wav::truncate_to_cap(reply, config.network.max_response_bytes);
    protocol::send_message(&mut stream, &reply, config.network.max_retries)
}
