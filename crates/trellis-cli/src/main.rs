//! Trellis CLI Client
//!
//! Joins one page of a project as a collaborator and drives the session
//! from an interactive prompt.
//!
//! # Usage
//!
//! ```bash
//! # Join a page on a local server
//! trellis --project demo --page home --token dev
//!
//! # Settings from a file, identity from the environment
//! TRELLIS_USER=u-42 trellis --config ~/.config/trellis.toml
//!
//! # Execute single command once synced
//! trellis --project demo -e tree
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use trellis_client::{Provider, ProviderCallbacks, ProviderConfig, ProviderStatus};
use trellis_core::Element;
use trellis_transport::{StaticToken, WebSocketConnector};

/// Trellis Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about = "Trellis CLI - collaborative page session client")]
struct Args {
    /// Server origin, e.g. wss://collab.example.com
    #[arg(short, long, env = "TRELLIS_URL")]
    url: Option<String>,

    #[arg(short, long, env = "TRELLIS_PROJECT")]
    project: Option<String>,

    #[arg(long, env = "TRELLIS_PAGE")]
    page: Option<String>,

    /// User id (random if unset)
    #[arg(long, env = "TRELLIS_USER")]
    user: Option<String>,

    /// Display name
    #[arg(short, long, env = "TRELLIS_USER_NAME")]
    name: Option<String>,

    /// Credential sent on every connection attempt
    #[arg(short, long, env = "TRELLIS_TOKEN", default_value = "")]
    token: String,

    /// TOML settings file
    #[arg(short, long, env = "TRELLIS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "TRELLIS_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Execute command once synced and exit
    #[arg(short, long)]
    exec: Option<String>,

    /// Quiet mode (no banner)
    #[arg(short, long)]
    quiet: bool,
}

/// One REPL command
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Tree,
    Pages,
    Users,
    Create(Element),
    Update(Element),
    Delete { id: String, children: Vec<String> },
    Move { id: String, parent: Option<String>, order: i64 },
    Cursor { x: f64, y: f64, element: Option<String> },
    Sync,
    Status,
    #[cfg(feature = "metrics")]
    Metrics,
    Help,
    Clear,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match head.to_lowercase().as_str() {
        "tree" => Command::Tree,
        "pages" => Command::Pages,
        "users" => Command::Users,
        "create" => Command::Create(parse_element(rest)?),
        "update" => Command::Update(parse_element(rest)?),
        "delete" | "del" => match args.split_first() {
            Some((id, children)) => Command::Delete {
                id: id.to_string(),
                children: children.iter().map(|c| c.to_string()).collect(),
            },
            None => bail!("usage: delete <id> [child...]"),
        },
        "move" => match args.as_slice() {
            [id, parent, order] => Command::Move {
                id: id.to_string(),
                parent: (*parent != "-").then(|| parent.to_string()),
                order: order.parse().context("order must be an integer")?,
            },
            _ => bail!("usage: move <id> <parent|-> <order>"),
        },
        "cursor" => match args.as_slice() {
            [x, y, rest @ ..] if rest.len() <= 1 => Command::Cursor {
                x: x.parse().context("x must be a number")?,
                y: y.parse().context("y must be a number")?,
                element: rest.first().map(|e| e.to_string()),
            },
            _ => bail!("usage: cursor <x> <y> [element]"),
        },
        "sync" => Command::Sync,
        "status" => Command::Status,
        #[cfg(feature = "metrics")]
        "metrics" => Command::Metrics,
        "help" => Command::Help,
        "clear" => Command::Clear,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{}', try 'help'", other),
    };
    Ok(command)
}

fn parse_element(json: &str) -> Result<Element> {
    if json.is_empty() {
        bail!("expected element JSON, e.g. {{\"id\":\"e1\",\"type\":\"text\"}}");
    }
    serde_json::from_str(json).context("invalid element JSON")
}

fn build_config(args: &Args) -> Result<ProviderConfig> {
    let mut config = match &args.config {
        Some(path) => ProviderConfig::load(path)?,
        None => ProviderConfig::default(),
    };
    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if let Some(project) = &args.project {
        config.project_id = project.clone();
    }
    if let Some(page) = &args.page {
        config.page_id = page.clone();
    }
    if let Some(user) = &args.user {
        config.user_id = user.clone();
    }
    if let Some(name) = &args.name {
        config.user_name = name.clone();
    }

    if config.project_id.is_empty() {
        bail!("no project given (--project or TRELLIS_PROJECT)");
    }
    if config.page_id.is_empty() {
        config.page_id = "home".into();
    }
    if config.user_id.is_empty() {
        config.user_id = format!("cli-{}", uuid::Uuid::new_v4());
    }
    if config.user_name.is_empty() {
        config.user_name = "trellis-cli".into();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&args)?;
    let callbacks = ProviderCallbacks::default()
        .on_error(|message| eprintln!("{} {}", "Server error:".red(), message))
        .on_presence(|update| {
            tracing::debug!(user = %update.user_id, x = update.cursor_x, y = update.cursor_y, "presence");
        });

    let provider = Provider::new(
        config.clone(),
        yrs::Doc::new(),
        Arc::new(WebSocketConnector::new()),
        Arc::new(StaticToken(args.token.clone())),
        callbacks,
    );

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  Trellis CLI
  Joining {}/{} on {} as {}
  Type 'help' for commands, 'quit' to exit
"#,
                config.project_id, config.page_id, config.url, config.user_name
            )
            .cyan()
        );
    }

    // Single command mode
    if let Some(line) = args.exec {
        let mut synced = provider.subscribe_synced();
        if !provider.is_synced() {
            tokio::time::timeout(Duration::from_secs(15), synced.recv())
                .await
                .context("timed out waiting for the initial sync")?
                .context("session closed before sync")?;
        }
        let command = parse_command(&line)?;
        execute(&provider, command).await?;
        provider.destroy();
        return Ok(());
    }

    let watcher = tokio::spawn(watch_status(provider.subscribe_status()));

    // Interactive mode
    let mut rl = DefaultEditor::new()?;
    let history_path = dirs_next::home_dir()
        .map(|p| p.join(".trellis_history"))
        .unwrap_or_default();

    let _ = rl.load_history(&history_path);

    loop {
        let prompt = format!("{}> ", "trellis".green());
        match tokio::task::block_in_place(|| rl.readline(&prompt)) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                let command = match parse_command(line) {
                    Ok(command) => command,
                    Err(e) => {
                        eprintln!("{} {}", "Error:".red(), e);
                        continue;
                    }
                };
                match command {
                    Command::Quit => break,
                    Command::Help => print_help(),
                    Command::Clear => print!("\x1B[2J\x1B[1;1H"),
                    command => {
                        if let Err(e) = execute(&provider, command).await {
                            eprintln!("{} {}", "Error:".red(), e);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    watcher.abort();
    provider.destroy();
    Ok(())
}

async fn watch_status(mut status: tokio::sync::watch::Receiver<ProviderStatus>) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        let label = match current {
            ProviderStatus::Connecting => "connecting".yellow(),
            ProviderStatus::Connected => "connected".green(),
            ProviderStatus::Disconnected => "disconnected".red(),
            ProviderStatus::Error => "connection error".red(),
        };
        println!("[{}]", label);
    }
}

async fn execute(provider: &Provider, command: Command) -> Result<()> {
    match command {
        Command::Tree => {
            let elements = provider.syncer().elements();
            if elements.is_empty() {
                println!("{}", "(empty)".dimmed());
            }
            print_tree(&elements, 0);
        }
        Command::Pages => {
            let pages = provider.syncer().pages();
            if pages.is_empty() {
                println!("{}", "(none)".dimmed());
            }
            for (i, page) in pages.iter().enumerate() {
                println!("{}) {}", i + 1, serde_json::to_string(page)?);
            }
        }
        Command::Users => {
            let snapshot = provider.awareness().snapshot();
            if snapshot.is_empty() {
                println!("{}", "(nobody else here)".dimmed());
            }
            for (user_id, user) in &snapshot.users {
                let cursor = snapshot.remote_users.get(user_id).copied().unwrap_or_default();
                let selection = snapshot
                    .selected_by_user
                    .get(user_id)
                    .cloned()
                    .flatten()
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{} {} ({}, {}) selected: {}",
                    user.user_name.bold(),
                    user_id.dimmed(),
                    cursor.x,
                    cursor.y,
                    selection
                );
            }
        }
        Command::Create(element) => {
            let ack = provider.create_element(element).await?;
            println!("{} {} ({})", "+OK created".green(), ack.element_id, ack.request_id.dimmed());
        }
        Command::Update(element) => {
            let ack = provider.update_element(element).await?;
            println!("{} {} ({})", "+OK updated".green(), ack.element_id, ack.request_id.dimmed());
        }
        Command::Delete { id, children } => {
            let ack = provider.delete_element(id, children).await?;
            println!("{} {} ({})", "+OK deleted".green(), ack.element_id, ack.request_id.dimmed());
        }
        Command::Move { id, parent, order } => {
            let ack = provider.move_element(id, parent, order).await?;
            println!("{} {} ({})", "+OK moved".green(), ack.element_id, ack.request_id.dimmed());
        }
        Command::Cursor { x, y, element } => {
            if provider.send_presence(x, y, element) {
                println!("{}", "+OK".green());
            } else {
                println!("{}", "queued".yellow());
            }
        }
        Command::Sync => {
            provider.request_sync();
            println!("{}", "sync requested".green());
        }
        Command::Status => {
            println!("status:    {:?}", provider.status());
            println!("socket:    {:?}", provider.connection_state());
            println!("synced:    {}", provider.is_synced());
            println!("pending:   {}", provider.pending_requests());
            println!("queued:    {}", provider.queued_messages());
        }
        #[cfg(feature = "metrics")]
        Command::Metrics => match provider.metrics() {
            Some(metrics) => print!("{}", metrics.export()),
            None => println!("{}", "(metrics unavailable)".dimmed()),
        },
        Command::Help | Command::Clear | Command::Quit => {}
    }
    Ok(())
}

fn print_tree(elements: &[Element], depth: usize) {
    for element in elements {
        let label = element.name.as_deref().unwrap_or("");
        println!(
            "{}{} {} {} {}",
            "  ".repeat(depth),
            element.id.yellow(),
            element.kind.cyan(),
            format!("#{}", element.order).dimmed(),
            label
        );
        print_tree(element.children(), depth + 1);
    }
}

fn print_help() {
    println!(
        r#"
{}

{}
  tree                                   Show the element tree
  pages                                  List pages
  users                                  Show who else is here

{}
  create <json>                          Create an element
  update <json>                          Replace an element
  delete <id> [child...]                 Delete an element and listed descendants
  move <id> <parent|-> <order>           Move an element ('-' for root)

{}
  cursor <x> <y> [element]               Send cursor and selection

{}
  sync                                   Request a full snapshot
  status                                 Connection and queue status

{}
  help                                   Show this help
  clear                                  Clear screen
  quit/exit                              Exit CLI
"#,
        "Trellis Commands".cyan().bold(),
        "Replica".yellow().bold(),
        "Mutations".yellow().bold(),
        "Presence".yellow().bold(),
        "Session".yellow().bold(),
        "Local".yellow().bold(),
    );
}

// Minimal dirs_next replacement for home directory
mod dirs_next {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mutations() {
        assert_eq!(
            parse_command("create {\"id\":\"e1\",\"type\":\"text\"}").unwrap(),
            Command::Create(Element::new("e1", "text"))
        );
        assert_eq!(
            parse_command("delete e1 e2 e3").unwrap(),
            Command::Delete {
                id: "e1".into(),
                children: vec!["e2".into(), "e3".into()]
            }
        );
        assert_eq!(
            parse_command("move e1 - 3").unwrap(),
            Command::Move {
                id: "e1".into(),
                parent: None,
                order: 3
            }
        );
        assert_eq!(
            parse_command("MOVE e1 box 0").unwrap(),
            Command::Move {
                id: "e1".into(),
                parent: Some("box".into()),
                order: 0
            }
        );
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(
            parse_command("cursor 1.5 2").unwrap(),
            Command::Cursor {
                x: 1.5,
                y: 2.0,
                element: None
            }
        );
        assert_eq!(
            parse_command("cursor 0 0 e7").unwrap(),
            Command::Cursor {
                x: 0.0,
                y: 0.0,
                element: Some("e7".into())
            }
        );
        assert!(parse_command("cursor 1").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("create").is_err());
        assert!(parse_command("create {oops").is_err());
        assert!(parse_command("move e1 - three").is_err());
        assert!(parse_command("frobnicate").is_err());
        assert_eq!(parse_command("quit").unwrap(), Command::Quit);
    }

    #[test]
    fn test_build_config_overrides() {
        let args = Args::parse_from(["trellis", "--project", "demo", "--name", "Ada"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.project_id, "demo");
        assert_eq!(config.page_id, "home");
        assert_eq!(config.user_name, "Ada");
        assert!(config.user_id.starts_with("cli-"));

        let args = Args::parse_from(["trellis", "--project", "", "--page", "p2"]);
        assert!(build_config(&args).is_err());
    }
}
