use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use meshcall_core::{
    ConnectionState, MeshEvent, MeshEventListener, RoomSession, RtcTransportFactory, SampleSource, SettingsStore,
    WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Join a meshcall room from the terminal.
#[derive(Parser, Debug)]
#[command(name = "meshcall", version)]
struct Args {
    /// Room to join.
    #[arg(long)]
    room: String,

    /// Display name shown to the other participants (saved for next time).
    #[arg(long)]
    name: Option<String>,

    /// Relay origin, e.g. https://meet.example.org (saved for next time).
    #[arg(long)]
    relay: Option<String>,

    /// Where settings.json lives. Defaults to the platform config dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshcall_core=debug,meshcall=info"));
        tracing_subscriber::fmt().with_env_filter(filter).with_ansi(false).init();
    });
}

struct Printer;

impl MeshEventListener for Printer {
    fn on_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::ConnectionStateChanged(ConnectionState::Disconnected) => println!("* disconnected"),
            MeshEvent::ConnectionStateChanged(_) => {}
            MeshEvent::Joined { client_id } => println!("* joined as {client_id}"),
            MeshEvent::PeerAdded(info) => println!("* {} is here", info.label()),
            MeshEvent::PeerStateChanged { peer_id, state } => println!("* {peer_id}: {state:?}"),
            MeshEvent::PeerRemoved(peer_id) => println!("* {peer_id} is gone"),
            MeshEvent::RemoteTrackAdded { peer_id, track } => println!("* {peer_id} sends {:?}", track.kind),
            MeshEvent::CandidateRejected { .. } => {}
            MeshEvent::ChatHistoryReceived(messages) => {
                for msg in messages {
                    println!("[{}] {}", msg.meta_line(), msg.body);
                }
            }
            MeshEvent::ChatMessageReceived(msg) => println!("[{}] {}", msg.meta_line(), msg.body),
            MeshEvent::ChatAvailabilityChanged(available) => {
                if available {
                    println!("* chat ready; /mute /video /peers /quit");
                }
            }
            MeshEvent::MediaControlsChanged(state) => {
                if state.available {
                    println!("* mic {:?} camera {:?}", state.audio_enabled, state.video_enabled);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => dirs::config_dir()
            .context("no config directory on this platform; pass --data-dir")?
            .join("meshcall"),
    };
    let store = SettingsStore::new(&data_dir);
    if let Some(relay) = args.relay {
        store.set_relay_url(relay);
    }
    if args.name.is_some() {
        store.set_display_name(args.name);
    }
    let settings = store.get();

    let transports = RtcTransportFactory::new(&settings).context("webrtc setup")?;
    let session = RoomSession::new(
        settings.clone(),
        Arc::new(WsConnector),
        Arc::new(transports),
        Arc::new(SampleSource),
    );
    session.add_listener(Arc::new(Printer));

    session
        .join(&args.room, settings.display_name.as_deref())
        .await
        .with_context(|| format!("joining {} via {}", args.room, settings.relay_url))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match line.trim() {
                    "/quit" => break,
                    "/mute" => match session.toggle_audio().await {
                        Some(enabled) => println!("* mic {}", if enabled { "on" } else { "off" }),
                        None => println!("* no microphone"),
                    },
                    "/video" => match session.toggle_video().await {
                        Some(enabled) => println!("* camera {}", if enabled { "on" } else { "off" }),
                        None => println!("* no camera"),
                    },
                    "/peers" => {
                        for peer in session.peers() {
                            let name = peer.name().unwrap_or(peer.peer_id());
                            println!("  {name} {:?}", peer.state());
                        }
                    }
                    text => {
                        if !text.is_empty() && !session.chat().send(text) {
                            println!("* not sent (not joined or too long)");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.leave().await;
    Ok(())
}
