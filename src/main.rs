//! # AI Tutor CLI (`tutor`)
//!
//! Terminal front end for the AI tutor backend: upload a PDF, ask questions,
//! and read grounded answers with a pointer to the accompanying diagram.
//!
//! ## Usage
//!
//! ```bash
//! tutor --config ./config/tutor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tutor init` | Create the local store and run schema migrations |
//! | `tutor health` | Report backend health (never fails) |
//! | `tutor info` | Show the backend's service banner |
//! | `tutor upload <file>` | Upload and index a PDF |
//! | `tutor ask "<question>"` | Ask one question |
//! | `tutor chat` | Interactive question loop |
//! | `tutor files list` / `tutor files delete <name>` | Manage uploaded files |
//! | `tutor images <topic>` | List diagrams for a topic |
//! | `tutor prefs show` / `tutor prefs set` | View or change preferences |
//!
//! Errors are reported on stderr as a short user-facing message; set
//! `RUST_LOG=ai_tutor=debug` for request-level diagnostics.

use ai_tutor::config::{self, LogFormat};
use ai_tutor::controller::{Answer, Services};
use ai_tutor::error_handler::{install_panic_hook, supervise};
use ai_tutor::event_bus::BusEvent;
use ai_tutor::logging;
use ai_tutor::migrate;
use ai_tutor::models::{HealthStatus, Role, Theme};
use ai_tutor::state::StateUpdate;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};

/// AI Tutor CLI: ask questions about your course PDFs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, built-in defaults are used
/// (backend at `http://localhost:8000`).
#[derive(Parser)]
#[command(
    name = "tutor",
    about = "AI Tutor: ask questions about your course PDFs",
    version,
    long_about = "Command-line client for a retrieval-augmented AI tutor backend. \
    Upload a PDF, ask questions, and get grounded answers with a matching diagram."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tutor.toml")]
    config: PathBuf,

    /// Override `[logging].level` (e.g. `debug`, `warn`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override `[logging].format`.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the local store.
    ///
    /// Creates the SQLite file configured in `[storage].path` and its
    /// key-value table. Safe to run repeatedly.
    Init,

    /// Check backend health.
    ///
    /// Prints `healthy`, `degraded`, or `unreachable`. Always exits 0.
    Health,

    /// Show the backend's service banner and endpoint list.
    Info,

    /// Upload a PDF for indexing.
    Upload {
        /// Path to the PDF file.
        file: PathBuf,
    },

    /// Ask a single question.
    Ask {
        /// The question text.
        question: String,

        /// Topic to ask about. Defaults to `[chat].default_topic`.
        #[arg(long)]
        topic: Option<String>,

        /// Also print the retrieved context passages.
        #[arg(long)]
        show_context: bool,
    },

    /// Interactive chat. Type `/quit` (or send EOF) to exit.
    Chat {
        /// Topic to ask about. Defaults to `[chat].default_topic`.
        #[arg(long)]
        topic: Option<String>,

        /// Upload this PDF before starting.
        #[arg(long)]
        upload: Option<PathBuf>,
    },

    /// Manage files uploaded to the backend.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// List diagrams available for a topic.
    Images {
        /// Topic identifier (e.g. `sound`).
        topic: String,
    },

    /// View or change preferences.
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum FilesAction {
    /// List uploaded files.
    List,
    /// Delete an uploaded file by name.
    Delete {
        /// File name as shown by `tutor files list`.
        name: String,
    },
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Print the stored preferences as JSON.
    Show,
    /// Update one or more preferences.
    Set {
        #[arg(long, value_enum)]
        theme: Option<Theme>,
        #[arg(long)]
        auto_scroll: Option<bool>,
        #[arg(long)]
        notifications: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load_config_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut log_config = cfg.logging.clone();
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    if let Err(e) = logging::init_logging(&log_config) {
        eprintln!("Warning: {}", e);
    }

    // Commands that don't need the service graph
    if let Commands::Init = cli.command {
        return match migrate::run_migrations(&cfg).await {
            Ok(()) => {
                println!(
                    "Local store initialized at {}.",
                    cfg.storage.path.display()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    let mut services = match Services::start(cfg).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    install_panic_hook(services.errors.clone());

    // Every failure reaches the error handler, which announces it here.
    let _errors = services.bus.on(BusEvent::ErrorRaised, |data| {
        let message = data["message"].as_str().unwrap_or("Something went wrong.");
        eprintln!("Error: {}", message);
        Ok(())
    });

    let errors = services.errors.clone();
    let outcome = supervise(&errors, "tutor", run(&mut services, cli.command)).await;
    services.shutdown().await;

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) | Err(_) => ExitCode::FAILURE,
    }
}

/// Execute one command. `Ok(false)` means the command failed and the
/// failure was already reported.
async fn run(services: &mut Services, command: Commands) -> anyhow::Result<bool> {
    match command {
        // Handled in main before the service graph is built.
        Commands::Init => Ok(true),
        Commands::Health => {
            let status = services.check_health().await;
            println!("{}", status.as_str());
            if status != HealthStatus::Healthy {
                eprintln!("(chat may be unavailable until the backend is healthy)");
            }
            Ok(true)
        }
        Commands::Info => match services.api.service_info().await {
            Ok(info) => {
                println!("{} (v{})", info.message, info.version);
                println!("status: {}", info.status);
                for (endpoint, description) in &info.endpoints {
                    let description = description.as_str().unwrap_or_default();
                    println!("  {:<24} {}", endpoint, description);
                }
                Ok(true)
            }
            Err(e) => {
                services.errors.handle(&e.into(), "info");
                Ok(false)
            }
        },
        Commands::Upload { file } => match services.upload(&file).await {
            Ok(upload) => {
                println!("uploaded:  {}", upload.filename);
                println!("topic_id:  {}", upload.topic_id);
                println!("chunks:    {}", upload.chunk_count);
                Ok(true)
            }
            Err(_) => Ok(false),
        },
        Commands::Ask {
            question,
            topic,
            show_context,
        } => {
            let topic = topic.unwrap_or_else(|| services.config.chat.default_topic.clone());
            match services.ask_topic(&question, &topic).await {
                Ok(answer) => {
                    render_answer(services, &answer, show_context);
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        }
        Commands::Chat { topic, upload } => {
            services.start_flush_timer();
            if let Some(path) = upload {
                if services.upload(&path).await.is_err() {
                    return Ok(false);
                }
                print_system_messages(services);
            }
            if let Some(topic) = topic {
                services
                    .state
                    .set_state(StateUpdate::default().topic(topic));
            }
            run_chat_loop(services).await?;
            Ok(true)
        }
        Commands::Files { action } => match action {
            FilesAction::List => match services.api.list_files().await {
                Ok(files) => {
                    if files.is_empty() {
                        println!("No files uploaded.");
                    }
                    for file in files {
                        match file.size_bytes {
                            Some(size) => println!("{:<48} {:>12} bytes", file.filename, size),
                            None => println!("{}", file.filename),
                        }
                    }
                    Ok(true)
                }
                Err(e) => {
                    services.errors.handle(&e.into(), "files.list");
                    Ok(false)
                }
            },
            FilesAction::Delete { name } => match services.api.delete_file(&name).await {
                Ok(()) => {
                    println!("Deleted {}.", name);
                    Ok(true)
                }
                Err(e) => {
                    services.errors.handle(&e.into(), "files.delete");
                    Ok(false)
                }
            },
        },
        Commands::Images { topic } => match services.api.get_images(&topic).await {
            Ok(catalog) => {
                println!("{} diagram(s) for topic '{}':", catalog.count, catalog.topic_id);
                for image in &catalog.images {
                    println!(
                        "  {:<32} {}",
                        image.filename,
                        if image.title.is_empty() { "-" } else { image.title.as_str() }
                    );
                }
                Ok(true)
            }
            Err(e) => {
                services.errors.handle(&e.into(), "images");
                Ok(false)
            }
        },
        Commands::Prefs { action } => match action {
            PrefsAction::Show => {
                let prefs = services.state.snapshot().preferences;
                println!("{}", serde_json::to_string_pretty(&prefs)?);
                Ok(true)
            }
            PrefsAction::Set {
                theme,
                auto_scroll,
                notifications,
            } => {
                let mut prefs = services.state.snapshot().preferences;
                if let Some(theme) = theme {
                    prefs.theme = theme;
                }
                if let Some(v) = auto_scroll {
                    prefs.auto_scroll = v;
                }
                if let Some(v) = notifications {
                    prefs.notifications_enabled = v;
                }
                services.set_preferences(prefs.clone()).await?;
                println!("{}", serde_json::to_string_pretty(&prefs)?);
                Ok(true)
            }
        },
    }
}

async fn run_chat_loop(services: &Services) -> anyhow::Result<()> {
    let topic = services
        .state
        .snapshot()
        .current_topic
        .unwrap_or_else(|| services.config.chat.default_topic.clone());
    println!("Chatting about '{}'. Type /quit to exit.", topic);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        if line == "/health" {
            println!("backend: {}", services.check_health().await.as_str());
            continue;
        }

        if let Ok(answer) = services.ask(line).await {
            render_answer(services, &answer, false);
        }
    }
    Ok(())
}

fn render_answer(services: &Services, answer: &Answer, show_context: bool) {
    println!();
    println!("{}", answer.response.answer);
    if let Some(image) = &answer.response.image {
        println!();
        let title = if image.title.is_empty() {
            image.filename.as_str()
        } else {
            image.title.as_str()
        };
        println!("Diagram: {} ({})", title, services.api.image_path(&image.filename).display());
        if !image.description.is_empty() {
            println!("         {}", image.description);
        }
    }
    if show_context && !answer.response.context_chunks.is_empty() {
        println!();
        println!("--- Context ({}) ---", answer.response.context_chunks.len());
        for (i, chunk) in answer.response.context_chunks.iter().enumerate() {
            println!("[{}] {}", i + 1, chunk);
        }
    }
    println!();
}

fn print_system_messages(services: &Services) {
    for message in services.state.messages() {
        if message.role == Role::System {
            println!("{}", message.content);
        }
    }
}
