use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use mindo_sync::auth::Session;
use mindo_sync::engine::{SyncEngine, WriteOutcome, WriteState};
use mindo_sync::extract::{LineSource, NOT_UNDERSTOOD, UtteranceSource, confirmation, extract};
use mindo_sync::query::{PaginatedResult, QueryDescriptor, SearchMode};
use mindo_sync::remote::{HttpRemote, RemoteClient};
use mindo_sync::store::LocalMirror;
use mindo_sync::types::{CreateItemInput, Item, UpdateItemInput};
use mindo_sync::{DEFAULT_PAGE_SIZE, init_store, resolve_api_base, resolve_data_dir};

#[derive(Parser)]
#[command(name = "mindo", about = "Mindo: remember where you put things")]
struct Cli {
    /// Output machine-readable JSON (default: human-readable)
    #[arg(long, global = true)]
    json: bool,

    /// API base URL (overrides MINDO_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Local data directory (overrides MINDO_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PageArgs {
    #[arg(long, default_value = "1")]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
}

#[derive(Subcommand)]
enum Command {
    /// List remembered items
    List {
        #[command(flatten)]
        paging: PageArgs,
    },
    /// Search items; multi-word questions use AI search
    Search {
        query: Vec<String>,
        #[arg(long, conflicts_with = "keyword")]
        ai: bool,
        #[arg(long)]
        keyword: bool,
        #[command(flatten)]
        paging: PageArgs,
    },
    /// Remember an item, from a sentence or explicit fields
    Add {
        #[arg(long, requires = "location")]
        name: Option<String>,
        #[arg(long, requires = "name")]
        location: Option<String>,
        /// Sentence such as "I put my keys on the table"
        utterance: Vec<String>,
    },
    /// Read sentences from stdin, one per line, and remember each placement
    Listen,
    /// Change an item's name or location
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    /// Forget an item
    Remove { id: String },
    /// Show one item
    Get { id: String },
    /// Send items created while offline
    Sync,
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the signed-in user
    Whoami,
    /// Forget the saved session
    Logout,
}

// ============================================================================
// Output Formatting
// ============================================================================

/// Format a single item for prose output.
fn format_item(item: &Item) {
    println!("{} ({})", capitalize_first(&item.name), item.id);
    println!("  Location: {}", item.location);
    println!("  Updated: {}", item.updated_at.format("%Y-%m-%d %H:%M"));
    if item.is_provisional() {
        println!("  Status: not synced yet");
    }
}

/// Format a page of items, separated by blank lines, with a footer.
fn format_page(result: &PaginatedResult) {
    if result.items.is_empty() {
        eprintln!("No items found.");
        return;
    }
    for (i, item) in result.items.iter().enumerate() {
        if i > 0 {
            println!();
        }
        format_item(item);
    }
    let p = &result.pagination;
    println!();
    println!(
        "Page {} of {} ({} items)",
        p.page,
        p.total_pages.max(1),
        p.total_items
    );
}

/// Capitalize the first letter of a string.
fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Report a write; errors when the write did not take effect.
fn report_write(
    outcome: WriteOutcome,
    json: bool,
    done: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !outcome.success {
        let reason = outcome
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("{done} failed: {reason}").into());
    }

    if json {
        return print_json(&serde_json::json!({
            "item": outcome.item,
            "synced": outcome.state == WriteState::Reconciled,
        }));
    }
    if let Some(item) = &outcome.item {
        format_item(item);
    }
    match outcome.state {
        WriteState::ReconciledPending => eprintln!("{done} locally; will sync when online."),
        WriteState::RolledBack => {
            let reason = outcome.error.map(|e| e.to_string()).unwrap_or_default();
            eprintln!("{done} locally, but the server did not confirm ({reason}).");
        }
        _ => eprintln!("{done}."),
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api_url = cli.api_url.clone().unwrap_or_else(resolve_api_base);
    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);

    let store = init_store(&data_dir)?;
    let session = Session::persistent(store.clone());
    let remote = Arc::new(HttpRemote::new(api_url, session.clone()));
    let engine = SyncEngine::new(remote.clone(), LocalMirror::new(store));

    let result = run(cli, &engine, remote.as_ref(), &session).await;
    if engine.take_auth_required() {
        eprintln!("Your session has expired or you are not signed in. Run `mindo login` to sign in.");
    }
    result
}

async fn run(
    cli: Cli,
    engine: &SyncEngine,
    remote: &dyn RemoteClient,
    session: &Session,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::List { paging } => {
            let desc = QueryDescriptor::new(paging.page, paging.page_size, None);
            let result = engine.query(&desc).await;
            if cli.json {
                print_json(&result)?;
            } else {
                format_page(&result);
            }
        }

        Command::Search {
            query,
            ai,
            keyword,
            paging,
        } => {
            let text = query.join(" ");
            if text.trim().is_empty() {
                return Err("search needs a query".into());
            }
            let mut desc = QueryDescriptor::new(paging.page, paging.page_size, Some(&text));
            if ai {
                desc = desc.with_mode(SearchMode::NaturalLanguage);
            } else if keyword {
                desc = desc.with_mode(SearchMode::Keyword);
            }
            let result = engine.query(&desc).await;
            if cli.json {
                print_json(&result)?;
            } else {
                eprintln!("Searching ({})...", desc.mode.as_str());
                format_page(&result);
            }
        }

        Command::Add {
            name,
            location,
            utterance,
        } => {
            let (input, spoken) = match (name, location) {
                (Some(name), Some(location)) => (CreateItemInput::new(name, location), None),
                _ => {
                    let text = utterance.join(" ");
                    let placement = extract(&text).ok_or(NOT_UNDERSTOOD)?;
                    let spoken = confirmation(&placement);
                    (placement.into(), Some(spoken))
                }
            };
            let outcome = engine.create(&input).await;
            if let (Some(spoken), false, true) = (&spoken, cli.json, outcome.success) {
                println!("{spoken}");
            }
            report_write(outcome, cli.json, "Saved")?;
        }

        Command::Listen => {
            let mut source = LineSource::new(BufReader::new(tokio::io::stdin()));
            eprintln!("Listening. Say where you put something, one sentence per line.");
            while let Some(text) = source.next_utterance().await {
                let Some(placement) = extract(&text) else {
                    println!("{NOT_UNDERSTOOD}");
                    continue;
                };
                let spoken = confirmation(&placement);
                let outcome = engine.create(&placement.into()).await;
                match (outcome.success, outcome.state) {
                    (true, WriteState::ReconciledPending) => {
                        println!("{spoken} (saved offline)")
                    }
                    (true, _) => println!("{spoken}"),
                    (false, _) => {
                        let reason = outcome.error.map(|e| e.to_string()).unwrap_or_default();
                        println!("Sorry, I couldn't save that: {reason}");
                    }
                }
            }
        }

        Command::Update { id, name, location } => {
            let outcome = engine.update(&id, &UpdateItemInput { name, location }).await;
            report_write(outcome, cli.json, "Updated")?;
        }

        Command::Remove { id } => {
            let outcome = engine.remove(&id).await;
            report_write(outcome, cli.json, "Removed")?;
        }

        Command::Get { id } => {
            let item = engine
                .get(&id)
                .await
                .ok_or_else(|| format!("No item with id '{id}'."))?;
            if cli.json {
                print_json(&item)?;
            } else {
                format_item(&item);
            }
        }

        Command::Sync => {
            let before = engine.pending().len();
            let synced = engine.sync_pending().await;
            let remaining = engine.pending().len();
            if cli.json {
                print_json(&serde_json::json!({ "synced": synced, "remaining": remaining }))?;
            } else if before == 0 {
                eprintln!("Nothing to sync.");
            } else {
                eprintln!("Synced {synced} item(s); {remaining} still pending.");
            }
        }

        Command::Login { email, password } => {
            let token = remote.login(&email, &password).await.into_result()?;
            if cli.json {
                print_json(&token.user)?;
            } else {
                eprintln!("Signed in as {}.", token.user.email);
            }
        }

        Command::Signup {
            email,
            password,
            name,
        } => {
            let user = remote
                .signup(&email, &password, name.as_deref())
                .await
                .into_result()?;
            if cli.json {
                print_json(&user)?;
            } else {
                eprintln!("Account created for {}. Run `mindo login` to sign in.", user.email);
            }
        }

        Command::Whoami => {
            let current = remote.current_user().await.into_result()?;
            match (current.user, cli.json) {
                (Some(user), true) => print_json(&user)?,
                (Some(user), false) => {
                    println!("{}", user.email);
                    if let Some(name) = user.name {
                        println!("  Name: {name}");
                    }
                }
                (None, _) => eprintln!("Not signed in."),
            }
        }

        Command::Logout => {
            session.clear();
            eprintln!("Signed out.");
        }
    }
    Ok(())
}
