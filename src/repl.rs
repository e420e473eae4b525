// Interactive shell for joining rooms and trading files
use crate::offers::FileOffer;
use crate::session::{Client, ClientEvent, SessionSnapshot};
use colored::Colorize;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::Editor;
use rustyline::{Context, Helper};
use std::borrow::Cow;
use strsim::levenshtein;

const COMMANDS: &[&str] = &[
    "help", "h", "status", "s", "join", "leave", "peers", "offers", "offer", "unoffer", "get",
    "downloads", "dl", "clear", "cls", "quit", "exit", "q",
];

pub struct ReplContext {
    pub client: Client,
}

// REPL helper for completion and highlighting
struct ReplHelper {
    commands: Vec<&'static str>,
}

impl ReplHelper {
    fn new() -> Self {
        ReplHelper {
            commands: COMMANDS.to_vec(),
        }
    }
}

impl Completer for ReplHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let line = &line[..pos];
        let parts: Vec<&str> = line.split_whitespace().collect();

        if parts.is_empty() || (parts.len() == 1 && !line.ends_with(' ')) {
            let prefix = parts.first().unwrap_or(&"");
            let matches: Vec<Pair> = self
                .commands
                .iter()
                .filter(|cmd| cmd.starts_with(prefix))
                .map(|cmd| Pair {
                    display: cmd.to_string(),
                    replacement: cmd.to_string(),
                })
                .collect();
            Ok((line.len() - prefix.len(), matches))
        } else {
            Ok((0, vec![]))
        }
    }
}

impl Hinter for ReplHelper {
    type Hint = String;
}

impl Highlighter for ReplHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        match line.split_once(' ') {
            Some((command, rest)) if self.commands.contains(&command) => {
                Cow::Owned(format!("{} {}", command.cyan(), rest))
            }
            _ => Cow::Borrowed(line),
        }
    }
}

impl Validator for ReplHelper {}

impl Helper for ReplHelper {}

pub async fn run_repl(context: ReplContext) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = context.client.snapshot().await?;

    println!("\n┌────────────────────────────────────────────────────────┐");
    println!("│ {:<54} │", "PeerSend v0.1.0 - Interactive Shell");
    println!("│ {:<54} │", "Type 'help' for commands, 'quit' to exit");
    println!("└────────────────────────────────────────────────────────┘");
    println!("\nDisplay name: {}", snapshot.display_name);
    println!();

    let helper = ReplHelper::new();
    let mut rl = Editor::new()?;
    rl.set_helper(Some(helper));

    let history_file = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".peersend_history"))
        .unwrap_or_else(|| std::path::PathBuf::from(".peersend_history"));

    let _ = rl.load_history(&history_file);

    loop {
        let readline = rl.readline("peersend> ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                let parts: Vec<&str> = line.split_whitespace().collect();
                let command = parts[0];
                let args = &parts[1..];

                match handle_command(command, args, &context).await {
                    Ok(should_exit) => {
                        if should_exit {
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("{}", format!("❌ Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("exit");
                break;
            }
            Err(err) => {
                eprintln!("Readline error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_file);
    println!("Shutting down gracefully...");
    Ok(())
}

async fn handle_command(
    command: &str,
    args: &[&str],
    context: &ReplContext,
) -> Result<bool, String> {
    match command {
        "help" | "h" | "?" => print_help(),
        "quit" | "exit" | "q" => return Ok(true),
        "status" | "s" => cmd_status(context).await?,
        "join" => cmd_join(args, context).await?,
        "leave" => {
            context.client.leave_room().await.map_err(|e| e.to_string())?;
            println!("{}", "✓ Left room".green());
        }
        "peers" => cmd_peers(context).await?,
        "offers" => cmd_offers(context).await?,
        "offer" => cmd_offer(args, context).await?,
        "unoffer" => cmd_unoffer(args, context).await?,
        "get" => cmd_get(args, context).await?,
        "downloads" | "dl" => cmd_downloads(context).await?,
        "clear" | "cls" => print!("\x1B[2J\x1B[1;1H"),
        _ => suggest_command(command),
    }
    Ok(false)
}

fn suggest_command(command: &str) {
    let mut suggestions: Vec<(&str, usize)> = COMMANDS
        .iter()
        .map(|cmd| (*cmd, levenshtein(command, cmd)))
        .filter(|(_, dist)| *dist <= 2)
        .collect();
    suggestions.sort_by_key(|(_, dist)| *dist);

    println!("{}", format!("❌ Unknown command: '{}'", command).red());
    if let Some((suggestion, _)) = suggestions.first() {
        println!("{}", format!("💡 Did you mean: {}", suggestion).yellow());
    } else {
        println!("   Type 'help' for available commands");
    }
}

fn print_help() {
    println!("\n📚 Available Commands:");
    println!("  ┌────────────────────────────────────────────────────────┐");
    println!("  │ {:<54} │", "General");
    println!("  ├────────────────────────────────────────────────────────┤");
    println!("  │ {:<54} │", "  help, h, ?              Show this help message");
    println!("  │ {:<54} │", "  status, s               Show session status");
    println!("  │ {:<54} │", "  clear, cls              Clear screen");
    println!("  │ {:<54} │", "  quit, exit, q           Leave and exit");
    println!("  ├────────────────────────────────────────────────────────┤");
    println!("  │ {:<54} │", "Room");
    println!("  ├────────────────────────────────────────────────────────┤");
    println!("  │ {:<54} │", "  join <room>             Join a room");
    println!("  │ {:<54} │", "  leave                   Leave the current room");
    println!("  │ {:<54} │", "  peers                   List peers in the room");
    println!("  ├────────────────────────────────────────────────────────┤");
    println!("  │ {:<54} │", "Files");
    println!("  ├────────────────────────────────────────────────────────┤");
    println!("  │ {:<54} │", "  offer <path>...         Offer files to the room");
    println!("  │ {:<54} │", "  unoffer <n>             Withdraw local offer #n");
    println!("  │ {:<54} │", "  offers                  List local and remote offers");
    println!("  │ {:<54} │", "  get <n>                 Download remote offer #n");
    println!("  │ {:<54} │", "  downloads, dl           Show downloads in progress");
    println!("  └────────────────────────────────────────────────────────┘");
    println!();
}

async fn snapshot(context: &ReplContext) -> Result<SessionSnapshot, String> {
    context.client.snapshot().await.map_err(|e| e.to_string())
}

/// Remote offers in display order, numbered from 1 by `offers`.
fn numbered_remote_offers(snapshot: &SessionSnapshot) -> Vec<(String, FileOffer)> {
    snapshot
        .remote_offers
        .iter()
        .flat_map(|(peer, offers)| offers.iter().map(move |o| (peer.clone(), o.clone())))
        .collect()
}

fn peer_label(snapshot: &SessionSnapshot, peer_id: &str) -> String {
    snapshot
        .peers
        .iter()
        .find(|p| p.id == peer_id)
        .map(|p| p.display_name().to_string())
        .unwrap_or_else(|| peer_id.to_string())
}

fn parse_index(arg: Option<&&str>, len: usize, usage: &str) -> Result<usize, String> {
    let n: usize = arg
        .ok_or_else(|| format!("Usage: {}", usage))?
        .parse()
        .map_err(|_| format!("Usage: {}", usage))?;
    if n == 0 || n > len {
        return Err(format!("No entry #{} (have {})", n, len));
    }
    Ok(n - 1)
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

async fn cmd_status(context: &ReplContext) -> Result<(), String> {
    let snapshot = snapshot(context).await?;

    println!("\n📊 Session Status:");
    println!("  ┌────────────────────────────────────────────────────────┐");
    println!("  │ {:<54} │", format!("State: {}", snapshot.state));
    println!(
        "  │ {:<54} │",
        format!("Room: {}", snapshot.room.as_deref().unwrap_or("-"))
    );
    println!(
        "  │ {:<54} │",
        format!("Peer ID: {}", snapshot.self_id.as_deref().unwrap_or("-"))
    );
    println!("  │ {:<54} │", format!("Name: {}", snapshot.display_name));
    println!("  ├────────────────────────────────────────────────────────┤");
    println!("  │ {:<54} │", format!("Peers: {}", snapshot.peers.len()));
    println!("  │ {:<54} │", format!("Linked: {}", snapshot.linked_peers.len()));
    println!("  │ {:<54} │", format!("Offered: {}", snapshot.local_offers.len()));
    println!(
        "  │ {:<54} │",
        format!("Available: {}", numbered_remote_offers(&snapshot).len())
    );
    println!("  │ {:<54} │", format!("Downloading: {}", snapshot.downloads.len()));
    println!("  └────────────────────────────────────────────────────────┘");
    println!();
    Ok(())
}

async fn cmd_join(args: &[&str], context: &ReplContext) -> Result<(), String> {
    let room = args.first().ok_or("Usage: join <room>")?;
    println!("Joining {}...", room.cyan());
    let peers = context
        .client
        .join_room(room)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "{}",
        format!("✓ Joined {} with {} other peer(s)", room, peers.len()).green()
    );
    Ok(())
}

async fn cmd_peers(context: &ReplContext) -> Result<(), String> {
    let snapshot = snapshot(context).await?;
    if snapshot.peers.is_empty() {
        println!("No peers in the room");
        return Ok(());
    }

    println!("\n👥 Peers ({}):", snapshot.peers.len());
    for peer in &snapshot.peers {
        let linked = if snapshot.linked_peers.contains(&peer.id) {
            "linked".green()
        } else {
            "not linked".yellow()
        };
        println!("  {} {} [{}]", peer.display_name().bold(), peer.id.dimmed(), linked);
    }
    println!();
    Ok(())
}

async fn cmd_offers(context: &ReplContext) -> Result<(), String> {
    let snapshot = snapshot(context).await?;

    println!("\n📤 Offered by you:");
    if snapshot.local_offers.is_empty() {
        println!("  (none)");
    }
    for (i, offer) in snapshot.local_offers.iter().enumerate() {
        println!(
            "  {:>3}. {} ({})",
            i + 1,
            offer.name(),
            format_size(offer.size())
        );
    }

    println!("\n📥 Available from peers:");
    let remote = numbered_remote_offers(&snapshot);
    if remote.is_empty() {
        println!("  (none)");
    }
    for (i, (peer, offer)) in remote.iter().enumerate() {
        println!(
            "  {:>3}. {} ({}) from {}",
            i + 1,
            offer.name(),
            format_size(offer.size()),
            peer_label(&snapshot, peer).cyan()
        );
    }
    println!();
    Ok(())
}

async fn cmd_offer(args: &[&str], context: &ReplContext) -> Result<(), String> {
    if args.is_empty() {
        return Err("Usage: offer <path>...".to_string());
    }
    let paths: Vec<std::path::PathBuf> = args.iter().map(|a| crate::config::expand_tilde(a)).collect();
    let added = context
        .client
        .offer_paths(&paths)
        .await
        .map_err(|e| e.to_string())?;

    if added.is_empty() {
        println!("{}", "Already offered".yellow());
    }
    for offer in added {
        println!(
            "{}",
            format!("✓ Offering {} ({})", offer.name(), format_size(offer.size())).green()
        );
    }
    Ok(())
}

async fn cmd_unoffer(args: &[&str], context: &ReplContext) -> Result<(), String> {
    let snapshot = snapshot(context).await?;
    let index = parse_index(args.first(), snapshot.local_offers.len(), "unoffer <n>")?;
    let offer = &snapshot.local_offers[index];

    if context
        .client
        .unoffer_file(offer)
        .await
        .map_err(|e| e.to_string())?
    {
        println!("{}", format!("✓ Withdrew {}", offer.name()).green());
    }
    Ok(())
}

async fn cmd_get(args: &[&str], context: &ReplContext) -> Result<(), String> {
    let snapshot = snapshot(context).await?;
    let remote = numbered_remote_offers(&snapshot);
    let index = parse_index(args.first(), remote.len(), "get <n>")?;
    let (peer, offer) = &remote[index];

    context
        .client
        .request_file(peer, offer)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "Requested {} from {}",
        offer.name().bold(),
        peer_label(&snapshot, peer).cyan()
    );
    Ok(())
}

async fn cmd_downloads(context: &ReplContext) -> Result<(), String> {
    let snapshot = snapshot(context).await?;
    if snapshot.downloads.is_empty() {
        println!("No downloads in progress");
        return Ok(());
    }

    println!("\n⬇️  Downloads:");
    for download in &snapshot.downloads {
        println!(
            "  {} {:>5.1}% ({}/{} chunks) from {}",
            download.offer.name(),
            download.percent,
            download.received_chunks,
            download.total_chunks,
            peer_label(&snapshot, &download.peer_id).cyan()
        );
    }
    println!();
    Ok(())
}

/// One-line rendering of a session event for the shell, `None` for noise.
pub fn describe_event(event: &ClientEvent) -> Option<String> {
    let line = match event {
        ClientEvent::PeerJoined { peer_id } => format!("→ {} joined", peer_id).cyan().to_string(),
        ClientEvent::PeerLeft { peer_id } => format!("← {} left", peer_id).yellow().to_string(),
        ClientEvent::PeerInfoUpdated { peer } => format!(
            "ℹ {} is {}",
            peer.id,
            peer.display_name().bold()
        ),
        ClientEvent::RemoteOffersUpdated { peer_id, offers } => {
            format!("📥 {} now offers {} file(s)", peer_id, offers.len())
        }
        ClientEvent::DownloadCompleted { offer, path, .. } => format!(
            "✓ Downloaded {} to {}",
            offer.name(),
            path.display()
        )
        .green()
        .to_string(),
        ClientEvent::UploadCompleted { peer_id, offer } => {
            format!("✓ Sent {} to {}", offer.name(), peer_id).green().to_string()
        }
        ClientEvent::TransferFailed {
            peer_id,
            offer,
            direction,
            error,
        } => format!(
            "❌ {} of {} with {} failed: {}",
            direction,
            offer.name(),
            peer_id,
            error
        )
        .red()
        .to_string(),
        ClientEvent::LinkError { peer_id, error } => format!(
            "⚠ link error{}: {}",
            peer_id
                .as_deref()
                .map(|p| format!(" with {}", p))
                .unwrap_or_default(),
            error
        )
        .yellow()
        .to_string(),
        _ => return None,
    };
    Some(line)
}
