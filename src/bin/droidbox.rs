//! droidbox - Linux session runtime CLI
//!
//! Manages rootfs images and lightweight proot sessions on top of them.
//!
//! ## Usage
//!
//! ```sh
//! droidbox images
//! droidbox pull <image>
//! droidbox create <image> [--entry <cmd>]
//! droidbox start <session-id>
//! droidbox stop <session-id>
//! droidbox exec <session-id> <cmd> [args..]
//! droidbox list
//! droidbox delete <session-id>
//! droidbox evict <image>
//! droidbox cache-clear
//! ```
//!
//! The image catalog is a JSON manifest, looked up at
//! `~/.droidbox/manifest.json` or via `--manifest <path>`.

use droidbox::{
    CancelFlag, HttpTransport, ImageId, JsonFileStore, RootfsManager, RootfsManifest, RootfsStore,
    SessionConfig, SessionId, SessionManager,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Images,
    Pull {
        image: String,
    },
    Create {
        image: String,
        entry: Option<Vec<String>>,
    },
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    Exec {
        id: String,
        command: Vec<String>,
    },
    List,
    Delete {
        id: String,
    },
    Evict {
        image: String,
    },
    CacheClear,
    Version,
    Help,
}

struct Options {
    manifest: Option<PathBuf>,
    store: Option<PathBuf>,
}

fn parse_args() -> Result<(Command, Options), String> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = Options {
        manifest: None,
        store: None,
    };

    // Global options are extracted first so they can appear anywhere.
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--manifest" => {
                if i + 1 >= args.len() {
                    return Err("--manifest requires a path".to_string());
                }
                options.manifest = Some(PathBuf::from(args.remove(i + 1)));
                args.remove(i);
            }
            "--store" => {
                if i + 1 >= args.len() {
                    return Err("--store requires a path".to_string());
                }
                options.store = Some(PathBuf::from(args.remove(i + 1)));
                args.remove(i);
            }
            _ => i += 1,
        }
    }

    if args.is_empty() {
        return Ok((Command::Help, options));
    }

    let command = match args[0].as_str() {
        "images" => Command::Images,
        "pull" => {
            if args.len() < 2 {
                return Err("pull requires <image>".to_string());
            }
            Command::Pull {
                image: args[1].clone(),
            }
        }
        "create" => {
            if args.len() < 2 {
                return Err("create requires <image>".to_string());
            }
            let image = args[1].clone();
            let mut entry = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--entry" | "-e" => {
                        if i + 1 < args.len() {
                            entry = Some(args[i + 1..].to_vec());
                            break;
                        } else {
                            return Err("--entry requires a command".to_string());
                        }
                    }
                    _ => i += 1,
                }
            }
            Command::Create { image, entry }
        }
        "start" => {
            if args.len() < 2 {
                return Err("start requires <session-id>".to_string());
            }
            Command::Start {
                id: args[1].clone(),
            }
        }
        "stop" => {
            if args.len() < 2 {
                return Err("stop requires <session-id>".to_string());
            }
            Command::Stop {
                id: args[1].clone(),
            }
        }
        "exec" => {
            if args.len() < 3 {
                return Err("exec requires <session-id> <command..>".to_string());
            }
            Command::Exec {
                id: args[1].clone(),
                command: args[2..].to_vec(),
            }
        }
        "list" => Command::List,
        "delete" => {
            if args.len() < 2 {
                return Err("delete requires <session-id>".to_string());
            }
            Command::Delete {
                id: args[1].clone(),
            }
        }
        "evict" => {
            if args.len() < 2 {
                return Err("evict requires <image>".to_string());
            }
            Command::Evict {
                image: args[1].clone(),
            }
        }
        "cache-clear" => Command::CacheClear,
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        unknown => return Err(format!("unknown command: {unknown}")),
    };
    Ok((command, options))
}

// =============================================================================
// Setup
// =============================================================================

fn base_dir(options: &Options) -> PathBuf {
    options.store.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(".droidbox"))
            .unwrap_or_else(|| PathBuf::from(".droidbox"))
    })
}

fn load_manifest(options: &Options) -> Result<RootfsManifest, String> {
    let path = options
        .manifest
        .clone()
        .unwrap_or_else(|| base_dir(options).join("manifest.json"));
    if !path.exists() {
        return Err(format!("manifest not found at {}", path.display()));
    }
    RootfsManifest::from_file(&path).map_err(|e| e.to_string())
}

async fn build_manager(options: &Options) -> Result<SessionManager, String> {
    let base = base_dir(options);
    let manifest = load_manifest(options)?;
    let store = RootfsStore::with_path(base.join("images")).map_err(|e| e.to_string())?;
    let transport = Arc::new(HttpTransport::new().map_err(|e| e.to_string())?);
    let rootfs = Arc::new(RootfsManager::new(store, manifest, transport));
    let bridge = Arc::new(droidbox::bridge::proot::ProotBridge::new());
    let session_store =
        Arc::new(JsonFileStore::new(base.join("sessions.json")).map_err(|e| e.to_string())?);

    let manager = SessionManager::new(rootfs, bridge, session_store, base.join("run"));
    manager.recover().await.map_err(|e| e.to_string())?;
    Ok(manager)
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_images(manager: &SessionManager) -> Result<(), String> {
    println!("IMAGE\tSTATUS");
    for id in manager.rootfs().manifest().image_ids() {
        println!("{id}\t{}", manager.rootfs().status(id));
    }
    Ok(())
}

async fn cmd_pull(manager: &SessionManager, image: &str) -> Result<(), String> {
    let image: ImageId = image.parse().map_err(|e: droidbox::Error| e.to_string())?;

    // Print progress while the pull runs.
    let mut progress = manager.subscribe_rootfs();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            eprintln!("{}: {}", event.image, event.status);
        }
    });

    let result = manager.pull_image(&image, &CancelFlag::new()).await;
    reporter.abort();
    let path = result.map_err(|e| e.to_string())?;
    eprintln!("pulled {image} to {}", path.display());
    Ok(())
}

async fn cmd_create(
    manager: &SessionManager,
    image: &str,
    entry: Option<Vec<String>>,
) -> Result<(), String> {
    let image: ImageId = image.parse().map_err(|e: droidbox::Error| e.to_string())?;
    let mut config = SessionConfig::shell(image);
    if let Some(entry) = entry {
        config.entry = entry;
    }
    let session = manager
        .create_session(config)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", session.id());
    Ok(())
}

async fn cmd_list(manager: &SessionManager) -> Result<(), String> {
    println!("SESSION\tIMAGE\tSTATE\tCREATED");
    for session in manager.list_sessions().await {
        println!(
            "{}\t{}\t{}\t{}",
            session.id(),
            session.image(),
            session.state(),
            session.created_at().to_rfc3339()
        );
    }
    Ok(())
}

fn parse_session_id(id: &str) -> Result<SessionId, String> {
    id.parse().map_err(|_| format!("invalid session id: {id}"))
}

// =============================================================================
// Main
// =============================================================================

fn cmd_version() {
    println!("droidbox version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"droidbox - Linux session runtime

USAGE:
    droidbox <command> [options]

COMMANDS:
    images                       List catalog images and their status
    pull <image>                 Download, verify, and extract an image
    create <image> [--entry ..]  Create a session (prints its id)
    start <session-id>           Start a session
    stop <session-id>            Stop a session
    exec <session-id> <cmd..>    Run a command in a running session
    list                         List sessions
    delete <session-id>          Delete a stopped session
    evict <image>                Remove an image's local data
    cache-clear                  Delete cached archives, keep rootfs trees
    version                      Show version
    help                         Show this help

OPTIONS:
    --manifest <path>   Image manifest (default: ~/.droidbox/manifest.json)
    --store <path>      Data directory (default: ~/.droidbox)

EXAMPLES:
    droidbox pull ubuntu-22.04-arm64
    droidbox create ubuntu-22.04-arm64 --entry /bin/bash --login
    droidbox start 01923f6e-...
"#
    );
}

async fn run(command: Command, options: Options) -> Result<(), String> {
    match command {
        Command::Version => {
            cmd_version();
            return Ok(());
        }
        Command::Help => {
            cmd_help();
            return Ok(());
        }
        _ => {}
    }

    let manager = build_manager(&options).await?;
    match command {
        Command::Images => cmd_images(&manager),
        Command::Pull { image } => cmd_pull(&manager, &image).await,
        Command::Create { image, entry } => cmd_create(&manager, &image, entry).await,
        Command::Start { id } => {
            let id = parse_session_id(&id)?;
            manager.start_session(id).await.map_err(|e| e.to_string())?;
            eprintln!("started {id}");
            Ok(())
        }
        Command::Stop { id } => {
            let id = parse_session_id(&id)?;
            manager.stop_session(id).await.map_err(|e| e.to_string())?;
            eprintln!("stopped {id}");
            Ok(())
        }
        Command::Exec { id, command } => {
            let id = parse_session_id(&id)?;
            let output = manager
                .exec_in_session(id, &command)
                .await
                .map_err(|e| e.to_string())?;
            use std::io::Write;
            let _ = std::io::stdout().write_all(&output.stdout);
            let _ = std::io::stderr().write_all(&output.stderr);
            if output.exit_code != 0 {
                return Err(format!("command exited with code {}", output.exit_code));
            }
            Ok(())
        }
        Command::List => cmd_list(&manager).await,
        Command::Delete { id } => {
            let id = parse_session_id(&id)?;
            manager
                .delete_session(id)
                .await
                .map_err(|e| e.to_string())?;
            eprintln!("deleted {id}");
            Ok(())
        }
        Command::Evict { image } => {
            let image: ImageId = image.parse().map_err(|e: droidbox::Error| e.to_string())?;
            manager.evict_image(&image).await.map_err(|e| e.to_string())?;
            eprintln!("evicted {image}");
            Ok(())
        }
        Command::CacheClear => {
            let freed = manager
                .rootfs()
                .store()
                .clear_archive_cache()
                .map_err(|e| e.to_string())?;
            eprintln!("freed {freed} bytes");
            Ok(())
        }
        Command::Version | Command::Help => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (command, options) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    match run(command, options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
