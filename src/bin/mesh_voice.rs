//! Mesh voice client shell
//!
//! Connects to a relay, joins the room once the microphone track is ready
//! and maintains one WebRTC connection per peer. Control from stdin:
//!
//!   unlock          resume audio output
//!   mute / unmute   capture gain
//!   deafen / undeafen
//!   pos <peer> <x> <y> <z>
//!   quit
//!
//! With `--record`, the mixed playback (interleaved stereo f32 little-endian
//! at the configured sample rate) is written to a file instead of a sound
//! device.
//!
//! Usage:
//!   mesh-voice --url ws://localhost:8080/upgrade
//!   mesh-voice --config voice.json --unmuted --record room.f32

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use mesh_voice::{
    event_channel, PlaybackSink, RtcBackend, Session, SessionEvent, UiAction, UiNotice, VoiceConfig, VoiceError,
    WsChannel,
};

/// Playback block length
const BLOCK: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "mesh-voice", about = "Mesh WebRTC voice chat client")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay WebSocket URL (overrides the config file)
    #[arg(short, long)]
    url: Option<String>,

    /// Start with the microphone open
    #[arg(long)]
    unmuted: bool,

    /// Write mixed playback as raw f32 PCM to this file
    #[arg(long)]
    record: Option<PathBuf>,
}

/// Raw PCM file standing in for an output device
struct RawFileOutput {
    writer: BufWriter<File>,
}

impl PlaybackSink for RawFileOutput {
    fn play(&mut self, block: &[f32]) -> Result<(), VoiceError> {
        for sample in block {
            self.writer.write_all(&sample.to_le_bytes())?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), VoiceError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => VoiceConfig::load(path)?,
        None => VoiceConfig::default(),
    };
    if let Some(url) = args.url {
        config.signaling_url = url;
    }
    if args.unmuted {
        config.mute_on_connect = false;
    }
    config.validate()?;

    println!("========================================");
    println!("  Mesh Voice");
    println!("========================================");
    println!();
    println!("Relay:        {}", config.signaling_url);
    println!("Audio:        {} Hz, {} ch", config.sample_rate, config.channels);
    println!("Muted:        {}", config.mute_on_connect);
    println!("ICE servers:  {}", config.ice_servers.len());
    println!();

    let backend = Arc::new(RtcBackend::new(config.sample_rate, config.channels)?);
    let (events, rx) = event_channel::<RtcBackend>();

    let channel_events = events.clone();
    let sink = WsChannel::connect(&config.signaling_url, config.codec(), move |ev| {
        let _ = channel_events.send(SessionEvent::Channel(ev));
    })
    .await?;
    let sink = Arc::new(sink);

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let session = Session::new(&config, backend, sink.clone(), events.clone(), ui_tx);

    tokio::spawn(async move {
        while let Some(notice) = ui_rx.recv().await {
            match notice {
                UiNotice::MicrophoneDenied(text) => println!("[!] {}", text),
                UiNotice::Joined => println!("[OK] Joined the room"),
                UiNotice::AudioUnlocked => println!("[OK] Audio output running"),
                UiNotice::MuteChanged(mute) => println!("mute: {}", mute),
                UiNotice::DeafenChanged(deaf) => println!("deafen: {}", deaf),
                UiNotice::Disconnected { reason } => {
                    println!("Disconnected ({})", reason.as_deref().unwrap_or("no reason"))
                }
            }
        }
    });

    let input_sink = sink.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {}", e);
                    break;
                }
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            let action = match words.as_slice() {
                [] => continue,
                ["unlock"] | ["join"] => UiAction::UnlockAudio,
                ["mute"] => UiAction::SetMute(true),
                ["unmute"] => UiAction::SetMute(false),
                ["deafen"] => UiAction::SetDeafen(true),
                ["undeafen"] => UiAction::SetDeafen(false),
                ["pos", peer, x, y, z] => match (x.parse(), y.parse(), z.parse()) {
                    (Ok(x), Ok(y), Ok(z)) => UiAction::SetPeerPosition {
                        peer: (*peer).into(),
                        position: [x, y, z],
                    },
                    _ => {
                        warn!("pos expects three numbers");
                        continue;
                    }
                },
                ["quit"] | ["exit"] => {
                    info!("Closing relay connection");
                    input_sink.close();
                    break;
                }
                other => {
                    warn!("Unknown command: {}", other.join(" "));
                    continue;
                }
            };
            if events.send(SessionEvent::Ui(action)).is_err() {
                break;
            }
        }
    });

    match args.record {
        Some(path) => {
            println!("Recording playback to {}", path.display());
            let output = RawFileOutput {
                writer: BufWriter::new(File::create(&path)?),
            };
            session.run_with_output(rx, Box::new(output), BLOCK).await;
        }
        None => session.run(rx).await,
    }
    Ok(())
}
