//! Command-line interface.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{self, Config};
use crate::narrative::{NarrativeAdapter, EXIT_USAGE};
use crate::session::SessionStore;
use crate::types::SessionId;

#[derive(Parser)]
#[command(
    name = "vox-oracle",
    about = "Voice session orchestrator: Telegram capture, transcription, semantic search and oracle feedback",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// List persisted sessions
    Sessions {
        /// Verify audio checksums against the files on disk
        #[arg(long)]
        verify: bool,
    },
    /// Check configuration and capability reachability
    Doctor {
        /// Store the LLM/embedding API key in the keyring
        #[arg(long)]
        set_api_key: Option<String>,
    },
    /// Run the narrative artifact chain over a finalized session
    Narrative {
        /// Session id (YYYY-MM-DD_HH-MM-SS)
        session_id: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => crate::daemon::run(config).await,
        Command::Sessions { verify } => sessions(&config, verify),
        Command::Doctor { set_api_key } => doctor(&config, set_api_key).await,
        Command::Narrative { session_id } => {
            let id = SessionId(session_id);
            if !id.is_well_formed() {
                eprintln!("invalid session id '{id}' (expected YYYY-MM-DD_HH-MM-SS)");
                std::process::exit(EXIT_USAGE);
            }
            let store = SessionStore::new(&config.paths.sessions_root);
            let adapter = NarrativeAdapter::new(store, config.narrative.command.clone());
            std::process::exit(adapter.run(&id).await);
        }
    }
}

fn sessions(config: &Config, verify: bool) -> Result<()> {
    let store = SessionStore::new(&config.paths.sessions_root);
    let sessions = store.load_all()?;
    if sessions.is_empty() {
        println!("No sessions under {}", config.paths.sessions_root.display());
        return Ok(());
    }
    let capture = crate::session::AudioCapture::new(store.clone(), config.transcription.audio_ext.clone());
    println!("{:<20} {:<14} {:>6} {:>6}  NAME", "ID", "STATE", "AUDIO", "CYCLE");
    for session in sessions {
        println!(
            "{:<20} {:<14} {:>6} {:>6}  {}",
            session.id,
            session.state.to_string(),
            session.audio_entries.len(),
            session.reopen_count,
            session.intelligible_name,
        );
        if verify {
            let report = capture.verify_integrity(&session)?;
            if report.is_clean() {
                println!("    checksums ok ({} segment(s))", report.verified.len());
            } else {
                println!(
                    "    CHECKSUM MISMATCH on {:?}, MISSING {:?}",
                    report.mismatched, report.missing
                );
            }
        }
    }
    Ok(())
}

async fn doctor(config: &Config, set_api_key: Option<String>) -> Result<()> {
    if let Some(key) = set_api_key {
        config::set_api_key(&key)?;
        println!("✅ API key stored in keyring");
        return Ok(());
    }

    let mut ok = true;

    match config.validate() {
        Ok(()) => println!("✅ configuration valid"),
        Err(e) => {
            ok = false;
            println!("❌ configuration: {e}");
        }
    }

    if config.telegram.is_configured() {
        let client = crate::telegram::TelegramClient::new(config.telegram.clone());
        match client.get_me().await {
            Ok(me) => println!("✅ telegram bot @{}", me.username.unwrap_or_default()),
            Err(e) => {
                ok = false;
                println!("❌ telegram: {e}");
            }
        }
    } else {
        ok = false;
        println!("❌ telegram: bot token or allowed chat id missing");
    }

    match config::get_api_key() {
        Ok(_) => println!("✅ API key present"),
        Err(_) => println!("⚠️  no API key (embeddings degrade to hash backend, oracle disabled)"),
    }

    {
        use crate::transcription::Transcriber;
        let transcriber = crate::transcription::HttpTranscriber::new(config.transcription.clone());
        if transcriber.is_ready().await {
            println!("✅ transcription endpoint reachable");
        } else {
            println!("⚠️  transcription endpoint unreachable ({})", config.transcription.endpoint);
        }
    }

    {
        let registry = crate::oracle::PersonaRegistry::new(
            &config.paths.oracles_dir,
            std::time::Duration::from_secs(1),
        );
        match registry.list().await {
            Ok(personas) => println!("✅ {} persona(s) in {}", personas.len(), config.paths.oracles_dir.display()),
            Err(e) => println!("⚠️  persona scan failed: {e}"),
        }
    }

    println!(
        "{} tts {}",
        if config.tts.enabled { "✅" } else { "ℹ️ " },
        if config.tts.enabled { "enabled" } else { "disabled" }
    );

    if !ok {
        std::process::exit(crate::narrative::EXIT_CONFIG);
    }
    Ok(())
}
