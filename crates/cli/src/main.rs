use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use murmur::{
    ChatEvent, ChatManager, JsonFileStore, ProviderSummarizer, RowKind, SessionId, SessionStore,
    SettingsStore, StoreError, StreamOutcome, Submission, search_commands,
};
use murmur_llm::{ProviderError, create_provider};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "murmur",
    version,
    about = "Line-oriented chat client. Lines starting with ':' are commands."
)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Session snapshot file (defaults to the platform data directory)
    #[arg(long, value_name = "PATH")]
    session_file: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset, e.g. `debug` or `murmur=trace`
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to create the chat provider: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("session store failed: {source}"))]
    Sessions {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("failed to read from stdin: {source}"))]
    ReadStdin {
        stage: &'static str,
        source: std::io::Error,
    },
}

type CliResult<T> = Result<T, CliError>;

/// A bare prefix lists the available commands.
const HELP_INPUT: &str = ":";

#[tokio::main]
async fn main() {
    if let Err(error) = run(Cli::parse()).await {
        eprintln!("murmur: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let settings_store = Arc::new(match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    });
    let settings = settings_store.settings();
    init_logging(cli.log_level.as_deref().unwrap_or(&settings.log_level));

    let provider = create_provider(settings.to_provider_config()).context(CreateProviderSnafu {
        stage: "create-provider",
    })?;
    let summarizer =
        ProviderSummarizer::new(provider.clone(), settings.model_config.model.clone());

    let store = JsonFileStore::new(cli.session_file.unwrap_or_else(JsonFileStore::default_path));
    let snapshot = store.load().context(SessionsSnafu {
        stage: "load-sessions",
    })?;

    let manager = ChatManager::builder(provider, settings_store)
        .summarizer(Arc::new(summarizer))
        .snapshot(snapshot.unwrap_or_default())
        .build();
    tracing::info!(
        sessions = manager.session_count(),
        provider = manager.provider().id(),
        "chat ready"
    );

    let printer = tokio::spawn(print_events(manager.subscribe()));
    print_session(&manager, manager.current_session_id());
    let repl = repl(&manager).await;

    let stopped = manager.stop_all();
    if stopped > 0 {
        tracing::info!(stopped, "cancelled in-flight requests on exit");
    }
    printer.abort();
    store.save(&manager.snapshot()).context(SessionsSnafu {
        stage: "save-sessions",
    })?;
    repl
}

fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn repl(manager: &ChatManager) -> CliResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context(ReadStdinSnafu { stage: "read-line" })?,
            _ = tokio::signal::ctrl_c() => {
                report_stopped(manager.stop_all());
                continue;
            }
        };
        let Some(line) = line else {
            return Ok(());
        };

        if line.trim() == HELP_INPUT {
            print_commands();
            continue;
        }

        let session_id = manager.current_session_id();
        match manager.submit(session_id, &line) {
            Submission::Ignored => {}
            Submission::Command(command) => {
                tracing::debug!(?command, "command applied");
                print_session(manager, manager.current_session_id());
            }
            Submission::Sent(handle) => {
                let settled = handle.settled();
                tokio::pin!(settled);
                loop {
                    tokio::select! {
                        outcome = &mut settled => {
                            tracing::debug!(?outcome, "reply settled");
                            break;
                        }
                        _ = tokio::signal::ctrl_c() => report_stopped(manager.stop_all()),
                    }
                }
            }
        }
    }
}

/// Streams reply text to stdout as it arrives.
async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "terminal fell behind the event stream");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let mut stdout = std::io::stdout().lock();
        let _ = match event {
            ChatEvent::Delta { delta, .. } => write!(stdout, "{delta}"),
            ChatEvent::Settled { outcome, .. } => match outcome {
                StreamOutcome::Completed | StreamOutcome::Dropped => writeln!(stdout),
                StreamOutcome::Cancelled => writeln!(stdout, " [stopped]"),
                StreamOutcome::Failed(reason) => writeln!(stdout, "\n[error: {reason}]"),
            },
            ChatEvent::TopicChanged { topic, .. } => writeln!(stdout, "[topic: {topic}]"),
            _ => Ok(()),
        };
        let _ = stdout.flush();
    }
}

fn print_session(manager: &ChatManager, session_id: SessionId) {
    let Some(session) = manager.session(session_id) else {
        return;
    };
    let Some(slice) = manager.render(session_id, None) else {
        return;
    };

    println!(
        "== {} ({}/{}) ==",
        session.topic,
        manager.current_index() + 1,
        manager.session_count()
    );
    for (row_index, row) in slice.rows.iter().enumerate() {
        match row.kind {
            RowKind::LoadingPreview | RowKind::DraftPreview => continue,
            RowKind::Context => {
                println!("[{}] {}", row.message.role.as_str(), row.message.content);
            }
            RowKind::Greeting | RowKind::Live => {
                println!("{}: {}", row.message.role.as_str(), row.message.content);
            }
        }
        if slice.divider_after == Some(row_index) {
            println!("-- context cleared --");
        }
    }
}

fn print_commands() {
    for spec in search_commands(HELP_INPUT) {
        println!("  :{:<6} {}", spec.name, spec.description);
    }
}

fn report_stopped(stopped: usize) {
    println!("[stopped {stopped} request(s)]");
}
