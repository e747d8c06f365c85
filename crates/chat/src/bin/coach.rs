use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use mindcoach_chat::{ChatConfig, ChatController, ChatError};
use mindcoach_llm::{API_KEY_ENV_VAR, CredentialStore, GeminiClient};
use mindcoach_storage::{MessageId, MessageRecord, MessageRole, SqliteStorage};

const DATABASE_ENV_VAR: &str = "MINDCOACH_DB";
const DEFAULT_DATABASE_PATH: &str = "mindcoach.db";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let database_path =
        std::env::var(DATABASE_ENV_VAR).unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
    let storage = SqliteStorage::open(&database_path).await?;

    let credentials = CredentialStore::new()?;
    let Some(api_key) = credentials.resolve()? else {
        eprintln!(
            "No API key found. Set {API_KEY_ENV_VAR} or put one in {}.",
            credentials.path().display()
        );
        return Ok(());
    };

    let client = GeminiClient::new(api_key)?;
    let controller =
        ChatController::new(storage, Arc::new(client), ChatConfig::default()).await?;

    println!("mindcoach. Commands: /branch N, /main, /delete N, /undo, /quit.");
    repl(&controller).await
}

async fn repl(controller: &ChatController) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = std::io::stdin();
    let mut last_deleted: Option<MessageId> = None;

    loop {
        render(controller).await?;
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse_command(input) {
            Command::Quit => return Ok(()),
            Command::Main => controller.return_to_main().await?,
            Command::Branch(index) => {
                if let Some(message) = nth_visible(controller, index).await? {
                    controller.enter_branch(message.id).await?;
                } else {
                    println!("No message #{index} in the current view.");
                }
            }
            Command::Delete(index) => {
                if let Some(message) = nth_visible(controller, index).await? {
                    let removed = controller.delete_message(message.id).await?;
                    last_deleted = Some(message.id);
                    println!("Deleted {removed} message(s). /undo restores them.");
                } else {
                    println!("No message #{index} in the current view.");
                }
            }
            Command::Undo => match last_deleted.take() {
                Some(message_id) => {
                    let restored = controller.undo_delete(message_id).await?;
                    println!("Restored {restored} message(s).");
                }
                None => println!("Nothing to undo."),
            },
            Command::Unknown(name) => println!("Unknown command: {name}"),
            Command::Say(text) => {
                let parent = branch_tip(controller).await?;
                match controller.send_message(&text, parent).await {
                    Ok(_) => {}
                    Err(error) => report(&error),
                }
            }
        }
    }
}

enum Command {
    Say(String),
    Branch(usize),
    Delete(usize),
    Main,
    Undo,
    Quit,
    Unknown(String),
}

fn parse_command(input: &str) -> Command {
    let Some(rest) = input.strip_prefix('/') else {
        return Command::Say(input.to_string());
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let argument = parts.next().and_then(|raw| raw.parse::<usize>().ok());

    match (name, argument) {
        ("quit", _) | ("exit", _) => Command::Quit,
        ("main", _) => Command::Main,
        ("undo", _) => Command::Undo,
        ("branch", Some(index)) => Command::Branch(index),
        ("delete", Some(index)) => Command::Delete(index),
        _ => Command::Unknown(format!("/{rest}")),
    }
}

async fn render(
    controller: &ChatController,
) -> Result<(), Box<dyn std::error::Error>> {
    let branch = controller.current_branch().await?;
    let location = if controller.cursor().await?.is_some() {
        "branch"
    } else {
        "main"
    };

    println!("--- {location} ({} messages) ---", branch.len());
    for (index, message) in branch.iter().enumerate() {
        let speaker = match message.role {
            MessageRole::User => "you",
            MessageRole::Assistant => "coach",
        };
        println!("{:>3}. [{speaker}] {}", index + 1, message.content);
    }

    Ok(())
}

async fn nth_visible(
    controller: &ChatController,
    index: usize,
) -> Result<Option<MessageRecord>, Box<dyn std::error::Error>> {
    let branch = controller.current_branch().await?;
    Ok(index.checked_sub(1).and_then(|zero_based| branch.get(zero_based).cloned()))
}

/// New messages continue under the newest message of the active branch,
/// or flat on the main line when no branch is active.
async fn branch_tip(
    controller: &ChatController,
) -> Result<Option<MessageId>, Box<dyn std::error::Error>> {
    if controller.cursor().await?.is_none() {
        return Ok(None);
    }

    let branch = controller.current_branch().await?;
    Ok(branch.last().map(|message| message.id))
}

fn report(error: &ChatError) {
    println!("{}", error.user_message());
    tracing::debug!(error = %error, "turn failed");
}
