#![deny(unsafe_code)]

//! Nurture CLI: send messages and inspect the dispatcher's persisted state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use nurture_config::AppConfig;
use nurture_core::{
    App, ChatMessage, ConversationContext, ConversationId, Priority, Role, build_info,
};

/// Nurture: a rate-limited, persistent AI completion dispatcher.
#[derive(Parser)]
#[command(name = "nurture", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "nurture.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message and wait for the answer.
    Send {
        /// The message text.
        message: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,

        /// Queue priority: high, normal or low.
        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Return right after enqueueing.
        #[arg(long)]
        no_wait: bool,
    },

    /// List conversations.
    Conversations {
        #[arg(long)]
        json: bool,
    },

    /// Print one conversation.
    Show {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete a conversation.
    Delete { id: String },

    /// Show remaining rate-limit headroom.
    Quota,

    /// Reset all rate-limit windows.
    ResetQuota,

    /// Inspect or manage the request queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Manage the API key.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Show version and build information.
    Version,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Number of pending tasks.
    Length,
    /// Drop all pending tasks.
    Clear,
    /// Process tasks left over from a previous run.
    Resume,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store the API key.
    Set { key: String },
    /// Remove the stored API key.
    Clear,
    /// Report whether a key is available.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
        Commands::Version => {
            cmd_version();
            Ok(())
        }
        command => run_app_command(config, command).await,
    }
}

async fn run_app_command(config: AppConfig, command: Commands) -> Result<()> {
    let app = App::from_config(config)
        .await
        .context("failed to initialise application")?;
    let dispatcher = app.dispatcher();

    match command {
        Commands::Send {
            message,
            conversation,
            priority,
            no_wait,
        } => {
            app.start().await?;
            let conversation = conversation.map(ConversationId::from);
            let sent = dispatcher
                .send_message_with_priority(&message, conversation.as_ref(), priority)
                .await?;
            println!("conversation: {}", sent.conversation_id);

            if no_wait {
                println!("queued (task {})", sent.task_id);
                return Ok(());
            }
            app.wait_idle().await;

            let context = dispatcher
                .get_conversation(&sent.conversation_id)
                .await?
                .with_context(|| format!("conversation {} vanished", sent.conversation_id))?;
            match context
                .message_history
                .iter()
                .find(|m| m.id == sent.placeholder_id)
            {
                Some(answer) => println!("{}", answer.content),
                None => bail!("answer is no longer in the conversation history"),
            }
        }
        Commands::Conversations { json } => {
            let conversations = dispatcher.get_conversations().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conversations)?);
            } else if conversations.is_empty() {
                println!("No conversations.");
            } else {
                for context in &conversations {
                    println!("{}", summary_line(context));
                }
            }
        }
        Commands::Show { id, json } => {
            let id = ConversationId::from(id);
            let context = dispatcher
                .get_conversation(&id)
                .await?
                .with_context(|| format!("conversation {id} not found"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&context)?);
            } else {
                for message in &context.message_history {
                    println!("{}", transcript_line(message));
                }
            }
        }
        Commands::Delete { id } => {
            let id = ConversationId::from(id);
            if dispatcher.delete_conversation(&id).await? {
                println!("Deleted conversation {id}.");
            } else {
                bail!("conversation {id} not found");
            }
        }
        Commands::Quota => {
            let quota = dispatcher.get_rate_limit_status().await?;
            let limits = &app.config().rate_limit;
            println!(
                "minute: {}/{} requests remaining",
                quota.minute_remaining, limits.max_requests_per_minute
            );
            println!(
                "hour:   {}/{} requests remaining",
                quota.hour_remaining, limits.max_requests_per_hour
            );
            println!(
                "day:    {}/{} tokens remaining",
                quota.tokens_remaining, limits.max_tokens_per_day
            );
        }
        Commands::ResetQuota => {
            dispatcher.reset_rate_limits().await?;
            println!("Rate limits reset.");
        }
        Commands::Queue { action } => match action {
            QueueAction::Length => {
                let pending = app.queue().load_persisted().await?;
                println!("{}", pending.len());
            }
            QueueAction::Clear => {
                let dropped = app.queue().load_persisted().await?.len();
                dispatcher.clear_queue().await?;
                println!("Dropped {dropped} pending task(s).");
            }
            QueueAction::Resume => {
                let has_key = app.start().await?;
                let pending = dispatcher.get_queue_length();
                if !has_key && pending > 0 {
                    eprintln!("warning: no API key set; pending tasks will fail");
                }
                debug!(pending, "waiting for queue to drain");
                app.wait_idle().await;
                println!("Processed {pending} task(s).");
            }
        },
        Commands::Key { action } => match action {
            KeyAction::Set { key } => {
                dispatcher.set_api_key(&key).await?;
                println!("API key stored.");
            }
            KeyAction::Clear => {
                dispatcher.clear_api_key().await?;
                println!("API key removed.");
            }
            KeyAction::Status => {
                if dispatcher.has_api_key().await? {
                    println!("API key: set");
                } else {
                    println!(
                        "API key: not set (store one with `nurture key set` or export {})",
                        app.config().completion.api_key_env
                    );
                }
            }
        },
        Commands::Config { .. } | Commands::Version => {
            bail!("command runs without the application")
        }
    }

    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

fn cmd_version() {
    println!("nurture {}", build_info::version_string());
    if let Some(secs) = build_info::built_at_secs() {
        println!("built at {secs} (unix seconds)");
    }
}

/// Load the config file, or defaults when it does not exist.
///
/// The flag reports whether the file was found.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration in '{}'", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

const PREVIEW_CHARS: usize = 48;

/// First line of `text`, shortened to the preview width.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS - 1).collect();
        format!("{cut}…")
    } else {
        line.to_string()
    }
}

fn summary_line(context: &ConversationContext) -> String {
    let last = context
        .last_message()
        .map(|m| preview(&m.content))
        .unwrap_or_default();
    format!(
        "{}  {:>3} msg  {}",
        context.conversation_id,
        context.message_history.len(),
        last
    )
}

fn transcript_line(message: &ChatMessage) -> String {
    let content = match (message.role, message.content.is_empty()) {
        (Role::Assistant, true) => "(waiting for answer)",
        _ => message.content.as_str(),
    };
    format!("[{}] {}", message.role, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_test_utils::TestConfigBuilder;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_parse_send_command() {
        let cli = Cli::try_parse_from([
            "nurture",
            "-vv",
            "send",
            "Is sushi safe?",
            "--priority",
            "high",
            "--conversation",
            "abc",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Send {
                message,
                conversation,
                priority,
                no_wait,
            } => {
                assert_eq!(message, "Is sushi safe?");
                assert_eq!(conversation.as_deref(), Some("abc"));
                assert_eq!(priority, Priority::High);
                assert!(!no_wait);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_rejects_unknown_priority() {
        assert!(Cli::try_parse_from(["nurture", "send", "hi", "--priority", "urgent"]).is_err());
    }

    #[test]
    fn test_preview_truncates_first_line() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("first\nsecond"), "first");
        let long = "x".repeat(100);
        let shown = preview(&long);
        assert_eq!(shown.chars().count(), PREVIEW_CHARS);
        assert!(shown.ends_with('…'));
    }

    #[test]
    fn test_transcript_marks_pending_placeholder() {
        assert_eq!(
            transcript_line(&ChatMessage::placeholder(0)),
            "[assistant] (waiting for answer)"
        );
        assert_eq!(transcript_line(&ChatMessage::user("hi", 0)), "[user] hi");
    }

    #[tokio::test]
    async fn test_load_config_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let (config, found) = load_config(&tmp.path().join("missing.toml")).await.unwrap();
        assert!(!found);
        assert_eq!(config.rate_limit.max_requests_per_minute, 10);
    }

    #[tokio::test]
    async fn test_load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nurture.toml");
        let config = TestConfigBuilder::new()
            .max_requests_per_minute(3)
            .model("gpt-4o-mini")
            .build();
        tokio::fs::write(&path, toml::to_string_pretty(&config).unwrap())
            .await
            .unwrap();

        let (loaded, found) = load_config(&path).await.unwrap();
        assert!(found);
        assert_eq!(loaded.rate_limit.max_requests_per_minute, 3);
        assert_eq!(loaded.completion.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_load_config_reports_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nurture.toml");
        tokio::fs::write(&path, "[context]\nmax_history = 0\n")
            .await
            .unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
