//! chatwire terminal client

use chatwire_client::progress::{TransferProgress, format_bytes};
use chatwire_client::{AgentConfig, AgentEvent, NetworkAgent};
use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// chatwire - chat and share files through a chatwire server
#[derive(Parser)]
#[command(name = "chatwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    server: String,

    /// Display name
    #[arg(short, long)]
    username: String,

    /// Directory for downloaded files
    #[arg(short, long)]
    download_dir: Option<PathBuf>,
}

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    Send(PathBuf),
    Get { name: String, save_path: Option<PathBuf> },
    Users,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Say(line.to_string()));
    }

    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "/send" if !rest.is_empty() => Some(Command::Send(PathBuf::from(rest))),
        "/get" if !rest.is_empty() => {
            let (name, save_path) = match rest.split_once(' ') {
                Some((name, path)) => (name, Some(PathBuf::from(path.trim()))),
                None => (rest, None),
            };
            Some(Command::Get {
                name: name.to_string(),
                save_path,
            })
        }
        "/users" => Some(Command::Users),
        "/quit" => Some(Command::Quit),
        _ => Some(Command::Help),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "warn" })
        .with_writer(std::io::stderr)
        .init();

    let download_dir = cli
        .download_dir
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = AgentConfig {
        server_addr: cli.server,
        download_dir,
        ..AgentConfig::default()
    };

    let (agent, events) = NetworkAgent::new(config);
    let agent = Arc::new(agent);
    agent.connect(&cli.username).await?;
    println!(
        "{} {} as {}. Type /send PATH, /get NAME [SAVE_PATH], /users or /quit.",
        style("connected to").green(),
        agent.config().server_addr,
        style(&cli.username).bold()
    );

    let printer = tokio::spawn(print_events(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };

        let result = match command {
            Command::Say(text) => agent.send_message(&text).await,
            Command::Send(path) => {
                spawn_upload(Arc::clone(&agent), path).await;
                Ok(())
            }
            Command::Get { name, save_path } => agent.request_download(&name, save_path).await,
            Command::Users => {
                for entry in agent.roster().await {
                    println!("  {} ({})", style(&entry.username).bold(), entry.uid);
                }
                Ok(())
            }
            Command::Quit => break,
            Command::Help => {
                println!("commands: /send PATH, /get NAME [SAVE_PATH], /users, /quit");
                Ok(())
            }
        };

        if let Err(e) = result {
            eprintln!("{} {e}", style("error:").red());
            if !agent.is_connected().await {
                break;
            }
        }
    }

    if agent.is_connected().await {
        agent.disconnect().await?;
    }
    drop(agent);
    printer.await?;
    Ok(())
}

async fn spawn_upload(agent: Arc<NetworkAgent>, path: PathBuf) {
    let size = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            eprintln!("{} {}: {e}", style("error:").red(), path.display());
            return;
        }
    };

    let label = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    tokio::spawn(async move {
        let progress = TransferProgress::new(&label, size);
        let result = agent.send_file(&path, |percent| progress.update(percent)).await;
        match result {
            Ok(name) => {
                progress.finish_with_message(format!("{name} uploaded ({})", format_bytes(size)));
            }
            Err(e) => progress.abandon_with_message(format!("{label} failed: {e}")),
        }
    });
}

async fn print_events(mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::UserConnected { username, .. } => {
                println!("{}", style(format!("* {username} joined")).dim());
            }
            AgentEvent::UserDisconnected { username, uid } => {
                let who = username.unwrap_or(uid);
                println!("{}", style(format!("* {who} left")).dim());
            }
            AgentEvent::MessageReceived {
                sender: Some(sender),
                text,
            } => println!("{}: {text}", style(sender).bold()),
            AgentEvent::MessageReceived { sender: None, text } => {
                println!("{}", style(text).yellow());
            }
            AgentEvent::FileAnnounced { sender, name } => {
                println!(
                    "{} {sender} shared {} (/get {name})",
                    style("*").cyan(),
                    style(&name).cyan()
                );
            }
            AgentEvent::DownloadProgress { .. } => {}
            AgentEvent::DownloadComplete { name, path } => {
                println!("{} {name} saved to {}", style("*").green(), path.display());
            }
            AgentEvent::DownloadFailed { name, reason } => {
                println!("{} download of {name} failed: {reason}", style("*").red());
            }
            AgentEvent::Disconnected { reason } => {
                println!("{} {reason}", style("disconnected:").red());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(parse_command("hello there"), Some(Command::Say("hello there".into())));
        assert_eq!(
            parse_command("/send /tmp/report.pdf"),
            Some(Command::Send(PathBuf::from("/tmp/report.pdf")))
        );
        assert_eq!(
            parse_command("/get report.pdf"),
            Some(Command::Get {
                name: "report.pdf".into(),
                save_path: None
            })
        );
        assert_eq!(
            parse_command("/get report.pdf /tmp/copy.pdf"),
            Some(Command::Get {
                name: "report.pdf".into(),
                save_path: Some(PathBuf::from("/tmp/copy.pdf"))
            })
        );
        assert_eq!(parse_command("/users"), Some(Command::Users));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("/send"), Some(Command::Help));
        assert_eq!(parse_command("/dance"), Some(Command::Help));
    }
}
