use anyhow::Context;
use clap::Parser;
use roomlink::config::Config;
use roomlink::domain::file_transfer::{safe_file_name, ReceivedFile};
use roomlink::domain::shared::value_objects::RoomId;
use roomlink::domain::whiteboard::{Color, Tool};
use roomlink::infrastructure::media::SyntheticMediaDevices;
use roomlink::infrastructure::protocols::webrtc::{
    Command, OutgoingFile, PeerConnectionManager, SessionUpdate, WebRtcPeerFactory,
};
use roomlink::infrastructure::protocols::SignalingConnection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Headless RoomLink peer: joins a room, answers and offers, writes
/// received files to disk. Reads commands from stdin.
#[derive(Debug, Parser)]
#[command(name = "roomlink-peer", version, about)]
struct Args {
    /// Room to join
    room: String,
    /// Override the signaling relay URL
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,
    /// Where received files are written
    #[arg(long, default_value = ".", value_name = "DIR")]
    output_dir: PathBuf,
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const HELP: &str = "commands: send <path> | audio | video | screen | down <x> <y> | move <x> <y> | up | pen | eraser | color <#rrggbb> | width <1-20> | clear | leave";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let room_id = RoomId::parse(args.room.as_str())?;
    let endpoint = args
        .endpoint
        .unwrap_or_else(|| config.client.signaling_url.clone());
    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("create {}", args.output_dir.display()))?;

    let connection = SignalingConnection::connect(&endpoint)
        .await
        .context("connect signaling websocket")?;
    let (signaling_tx, signaling_rx) = connection.into_parts();

    let factory = Arc::new(WebRtcPeerFactory::new(config.ice.stun_url.clone())?);
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let (manager, inbox) = PeerConnectionManager::new(
        room_id,
        factory,
        Arc::new(SyntheticMediaDevices),
        signaling_tx,
        updates_tx,
        config.negotiation_timeout(),
    );

    let (commands_tx, commands) = mpsc::unbounded_channel();
    commands_tx.send(Command::Start)?;
    let manager_task = tokio::spawn(manager.run(
        inbox,
        commands,
        signaling_rx,
        config.sweep_interval(),
    ));

    tokio::spawn(read_commands(commands_tx));
    println!("{HELP}");

    while let Some(update) = updates.recv().await {
        match update {
            SessionUpdate::Participants(participants) => {
                let names: Vec<&str> = participants
                    .iter()
                    .map(|p| p.display_name.as_str())
                    .collect();
                println!("participants: {}", names.join(", "));
            }
            SessionUpdate::LocalMedia(media) => {
                println!(
                    "audio {} / video {} ({:?})",
                    on_off(media.audio_enabled),
                    on_off(media.video_enabled),
                    media.video_source
                );
            }
            SessionUpdate::TransferStarted { peer_id, name, size, .. } => {
                println!("receiving {name} ({size} bytes) from {}", peer_id.short());
            }
            SessionUpdate::TransferProgress {
                transfer_id,
                direction,
                percent,
                ..
            } => {
                info!("{:?} transfer {}: {}%", direction, transfer_id, percent);
            }
            SessionUpdate::FileReceived { peer_id, file } => {
                match write_received(&args.output_dir, &file).await {
                    Ok(path) => println!(
                        "saved {} from {} to {}",
                        file.name,
                        peer_id.short(),
                        path.display()
                    ),
                    Err(e) => warn!("Failed to save {}: {}", file.name, e),
                }
            }
            SessionUpdate::FileSent { peer_id, name, .. } => {
                println!("sent {name} to {}", peer_id.short());
            }
            SessionUpdate::TransferFailed { peer_id, error, .. } => {
                println!("transfer with {} failed: {error}", peer_id.short());
            }
            SessionUpdate::LocalStroke(_) | SessionUpdate::RemoteStroke(_) => {}
            SessionUpdate::WhiteboardCleared => println!("whiteboard cleared"),
            SessionUpdate::CommandFailed { command, error } => {
                println!("{command} failed: {error}");
            }
            SessionUpdate::Left => println!("left the room"),
        }
    }

    manager_task.await?;
    Ok(())
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Write a received file under `dir`, never outside it and never over an
/// existing file
async fn write_received(dir: &Path, file: &ReceivedFile) -> std::io::Result<PathBuf> {
    let name = safe_file_name(&file.name);
    let mut path = dir.join(&name);
    let mut n = 1;
    while tokio::fs::try_exists(&path).await? {
        path = dir.join(format!("{n}-{name}"));
        n += 1;
    }
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
}

async fn read_commands(commands: mpsc::UnboundedSender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin: {}", e);
                break;
            }
        };
        let command = match parse_command(&line).await {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}\n{HELP}");
                continue;
            }
        };
        let leaving = matches!(command, Command::Leave);
        if commands.send(command).is_err() || leaving {
            return;
        }
    }
    let _ = commands.send(Command::Leave);
}

async fn parse_command(line: &str) -> anyhow::Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let point = |words: &mut std::str::SplitWhitespace<'_>| -> anyhow::Result<(f64, f64)> {
        let x = words.next().context("missing x")?.parse()?;
        let y = words.next().context("missing y")?.parse()?;
        Ok((x, y))
    };

    let command = match verb {
        "send" => {
            let path = line
                .trim_start()
                .strip_prefix("send")
                .map(str::trim)
                .unwrap_or_default();
            anyhow::ensure!(!path.is_empty(), "send needs a path");
            Command::SendFile(OutgoingFile::from_path(path).await?)
        }
        "audio" => Command::ToggleAudio,
        "video" => Command::ToggleVideo,
        "screen" => Command::ToggleScreenShare,
        "down" => {
            let (x, y) = point(&mut words)?;
            Command::PointerDown { x, y }
        }
        "move" => {
            let (x, y) = point(&mut words)?;
            Command::PointerMove { x, y }
        }
        "up" => Command::PointerUp,
        "pen" => Command::SetTool(Tool::Pen),
        "eraser" => Command::SetTool(Tool::Eraser),
        "color" => {
            let color: Color = words.next().context("missing color")?.parse()?;
            Command::SetColor(color)
        }
        "width" => Command::SetLineWidth(words.next().context("missing width")?.parse()?),
        "clear" => Command::ClearWhiteboard,
        "leave" | "quit" => Command::Leave,
        other => anyhow::bail!("unknown command {other:?}"),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_path_ignores_surrounding_whitespace() {
        let path = std::env::temp_dir().join(format!("roomlink-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"hello").unwrap();

        for line in [
            format!("  send   {}  ", path.display()),
            format!("\u{3000}send {}", path.display()),
        ] {
            match parse_command(&line).await.unwrap() {
                Some(Command::SendFile(file)) => {
                    assert_eq!(file.size(), 5);
                    assert_eq!(Some(file.name()), path.file_name().and_then(|n| n.to_str()));
                }
                other => panic!("expected send-file, got {other:?}"),
            }
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_send_without_path_is_rejected() {
        assert!(parse_command("send   ").await.is_err());
    }

    #[tokio::test]
    async fn test_whiteboard_style_commands() {
        assert!(matches!(
            parse_command("eraser").await.unwrap(),
            Some(Command::SetTool(Tool::Eraser))
        ));
        assert!(matches!(
            parse_command("color #ff8800").await.unwrap(),
            Some(Command::SetColor(c)) if c == Color::rgb(0xff, 0x88, 0x00)
        ));
        assert!(matches!(
            parse_command("width 8").await.unwrap(),
            Some(Command::SetLineWidth(w)) if w == 8.0
        ));
        assert!(parse_command("color red").await.is_err());
        assert!(matches!(
            parse_command("down 1 2").await.unwrap(),
            Some(Command::PointerDown { x, y }) if x == 1.0 && y == 2.0
        ));
    }
}
