//! murmur-admin - CLI for managing personas and poking conversations
//!
//! Usage:
//!   murmur-admin persona add <conversation> <name> [--mode m] [--percent n]
//!                            [--display name] [--personality text] [--tone text]
//!   murmur-admin persona list <conversation>
//!   murmur-admin persona mode <persona-id> <mode> [percent]
//!   murmur-admin persona rm <conversation> <name>
//!   murmur-admin say <conversation> <user> <text...>
//!   murmur-admin log <conversation> [limit]
//!   murmur-admin locks
//!   murmur-admin invoke <conversation> <persona-id|@name>

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;

use murmur::completion::OpenAiCompletion;
use murmur::config::Config;
use murmur::context::relative_age;
use murmur::db::messages::{Author, Message, MessageStore};
use murmur::db::personas::{EngagementMode, Persona, PersonaStore};
use murmur::db::{format_timestamp, now_ms, Database};
use murmur::orchestrator::{EngageOutcome, Orchestrator};
use murmur::paths;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    if matches!(args[1].as_str(), "help" | "--help" | "-h") {
        print_usage();
        return Ok(());
    }

    let config = Config::load(paths::config_path()).context("failed to load config")?;
    let db_path = config.db_path();
    paths::ensure_db_dir(&db_path)?;
    let db = Database::open(&db_path).context("failed to open database")?;

    match args[1].as_str() {
        "persona" => cmd_persona(&db, &args[2..])?,
        "say" => cmd_say(&db, &args[2..])?,
        "log" => cmd_log(&db, &args[2..])?,
        "locks" => cmd_locks(&db)?,
        "invoke" => cmd_invoke(db, &config, &args[2..])?,
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    eprintln!(
        r#"murmur-admin - Manage murmur personas and conversations

Usage:
  murmur-admin persona add <conversation> <name> [--mode off|mention_only|probabilistic]
                           [--percent 0-100] [--display name]
                           [--personality text] [--tone text]
  murmur-admin persona list <conversation>
  murmur-admin persona mode <persona-id> <mode> [percent]
  murmur-admin persona rm <conversation> <name>
  murmur-admin say <conversation> <user> <text...>
  murmur-admin log <conversation> [limit]
  murmur-admin locks
  murmur-admin invoke <conversation> <persona-id|@name>

Environment:
  MURMUR_DB       Override database path
  MURMUR_CONFIG   Override config file path

Paths:
  Config: {config}
  DB:     {db}

Examples:
  murmur-admin persona add kitchen sage --percent 30 --personality "dry wit"
  murmur-admin say kitchen amy "what's for dinner?"
  murmur-admin log kitchen 20
  murmur-admin invoke kitchen @sage
"#,
        config = paths::config_path().display(),
        db = paths::db_path().display(),
    );
}

/// Pull `--flag value` out of an argument list
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn parse_mode(s: &str) -> Result<EngagementMode> {
    EngagementMode::parse(s).with_context(|| format!("unknown engagement mode: {}", s))
}

fn parse_percent(s: &str) -> Result<u8> {
    let percent: u8 = s
        .parse()
        .with_context(|| format!("invalid percent: {}", s))?;
    if percent > 100 {
        anyhow::bail!("percent must be 0-100, got {}", percent);
    }
    Ok(percent)
}

fn cmd_persona(db: &Database, args: &[String]) -> Result<()> {
    match args.first().map(|s| s.as_str()) {
        Some("add") => {
            if args.len() < 3 {
                anyhow::bail!("Usage: murmur-admin persona add <conversation> <name> [options]");
            }
            let rest = &args[3..];
            let mut persona = Persona::new(&args[1], &args[2]);
            if let Some(mode) = flag(rest, "--mode") {
                persona.engagement_mode = parse_mode(mode)?;
            }
            if let Some(percent) = flag(rest, "--percent") {
                persona.engagement_percent = parse_percent(percent)?;
            }
            persona.display_name = flag(rest, "--display").map(String::from);
            persona.personality = flag(rest, "--personality").map(String::from);
            persona.tone = flag(rest, "--tone").map(String::from);

            db.insert_persona(&persona)?;
            println!("Added persona @{} ({})", persona.name, persona.id);
        }
        Some("list") => {
            let conversation = args
                .get(1)
                .context("Usage: murmur-admin persona list <conversation>")?;
            let personas = db.list_personas(conversation)?;
            if personas.is_empty() {
                println!("No personas in {}.", conversation);
                return Ok(());
            }
            println!("Personas in {}:", conversation);
            for p in personas {
                let last = p
                    .last_reply_at
                    .map(|at| relative_age(now_ms() - at))
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  @{:<16} {:<14} {:>3}%  last reply: {:<10} {}",
                    p.name,
                    p.engagement_mode.as_str(),
                    p.engagement_percent,
                    last,
                    p.id
                );
            }
        }
        Some("mode") => {
            if args.len() < 3 {
                anyhow::bail!("Usage: murmur-admin persona mode <persona-id> <mode> [percent]");
            }
            let mode = parse_mode(&args[2])?;
            let percent = args.get(3).map(|s| parse_percent(s)).transpose()?;
            if db.update_persona_engagement(&args[1], mode, percent)? {
                println!("Updated {}", args[1]);
            } else {
                anyhow::bail!("no persona with id {}", args[1]);
            }
        }
        Some("rm") => {
            if args.len() < 3 {
                anyhow::bail!("Usage: murmur-admin persona rm <conversation> <name>");
            }
            let name = args[2].trim_start_matches('@');
            let persona = db
                .get_persona_by_name(&args[1], name)?
                .with_context(|| format!("no persona @{} in {}", name, args[1]))?;
            db.delete_persona(&persona.id)?;
            println!("Removed @{} ({})", persona.name, persona.id);
        }
        _ => anyhow::bail!("Usage: murmur-admin persona <add|list|mode|rm> ..."),
    }
    Ok(())
}

fn cmd_say(db: &Database, args: &[String]) -> Result<()> {
    if args.len() < 3 {
        anyhow::bail!("Usage: murmur-admin say <conversation> <user> <text...>");
    }
    let message = Message::human(&args[0], &args[1], args[2..].join(" "));
    let seq = db.insert_message(&message)?;
    println!("Posted #{} {}", seq, message.id);
    Ok(())
}

fn cmd_log(db: &Database, args: &[String]) -> Result<()> {
    let conversation = args
        .first()
        .context("Usage: murmur-admin log <conversation> [limit]")?;
    let limit = match args.get(1) {
        Some(s) => s.parse().with_context(|| format!("invalid limit: {}", s))?,
        None => 20,
    };

    let personas = db.list_personas(conversation)?;
    for message in db.recent_messages(conversation, limit)? {
        let speaker = match &message.author {
            Author::Human(user) => user.clone(),
            Author::Persona(id) => personas
                .iter()
                .find(|p| &p.id == id)
                .map(|p| format!("@{}", p.name))
                .unwrap_or_else(|| format!("@{}", id)),
        };
        println!(
            "{}  {}: {}",
            format_timestamp(message.created_at),
            speaker,
            message.content
        );
        for media in &message.media {
            println!("{:22}[media] {}", "", media);
        }
    }
    Ok(())
}

fn cmd_locks(db: &Database) -> Result<()> {
    let locks = db.list_locks()?;
    if locks.is_empty() {
        println!("No engagement locks held.");
        return Ok(());
    }
    let now = now_ms();
    for lock in locks {
        let state = if lock.expires_at <= now {
            "expired".to_string()
        } else {
            format!("{}s left", (lock.expires_at - now) / 1000)
        };
        println!("  {:<24} {:<10} {}", lock.conversation_id, state, lock.holder_id);
    }
    Ok(())
}

fn cmd_invoke(db: Database, config: &Config, args: &[String]) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: murmur-admin invoke <conversation> <persona-id|@name>");
    }
    let conversation = &args[0];
    let persona_id = match args[1].strip_prefix('@') {
        Some(name) => {
            db.get_persona_by_name(conversation, name)?
                .with_context(|| format!("no persona @{} in {}", name, conversation))?
                .id
        }
        None => args[1].clone(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("murmur=info".parse()?),
        )
        .init();

    let trigger = db
        .latest_message(conversation)?
        .with_context(|| format!("no messages in {}", conversation))?;

    let db = Arc::new(db);
    let completion = Arc::new(OpenAiCompletion::from_config(&config.completion));
    let orchestrator = Orchestrator::new(db, completion, config.engagement.clone());

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(orchestrator.respond_now(
        conversation,
        &trigger,
        &persona_id,
        config.engagement.respond_now_timeout(),
    ));

    match outcome {
        EngageOutcome::Replied { message_id, .. } => println!("Replied: {}", message_id),
        EngageOutcome::Aborted(reason) => {
            println!("No reply: {}", reason);
            std::process::exit(2);
        }
    }
    Ok(())
}
