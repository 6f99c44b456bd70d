use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use cryptobox::{BoxConfig, CryptoBox, CryptoboxError};

/// Reference CLI for a file-backed crypto box.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Directory holding the box.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Choose a command to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the local identity fingerprint.
    Fingerprint,
    /// Generate one-time prekeys and print them as base64.
    Prekeys {
        #[arg(long, default_value_t = 0)]
        start: u32,
        #[arg(long, default_value_t = 10)]
        count: u32,
    },
    /// Print the last-resort prekey as base64.
    LastPrekey,
    /// List stored sessions.
    Sessions,
    /// Encrypt a message; pass the peer's base64 prekey to start a session.
    Encrypt {
        #[arg(long)]
        session: String,
        #[arg(long)]
        prekey: Option<String>,
        message: String,
    },
    /// Decrypt a base64 message, creating the session if needed.
    Decrypt {
        #[arg(long)]
        session: String,
        message: String,
    },
    /// Delete a stored session.
    DeleteSession {
        #[arg(long)]
        session: String,
    },
    /// Print the effective configuration.
    ShowConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => BoxConfig::load(path)?,
        None => BoxConfig::default(),
    };

    if let Some(dir) = cli.dir {
        config = config.with_path(dir);
    }

    let cbox = CryptoBox::open_with_config(&config)?;

    match cli.command {
        Commands::Fingerprint => {
            println!("{}", String::from_utf8(cbox.local_fingerprint()?)?);
        }
        Commands::Prekeys { start, count } => {
            let end = start.saturating_add(count);
            match cbox.generate_prekeys(start..end) {
                Ok(prekeys) => {
                    for prekey in prekeys {
                        println!("{}\t{}", prekey.id(), prekey.to_base64());
                    }
                }
                Err(CryptoboxError::InvalidArgument(reason)) => {
                    eprintln!("Cannot generate prekeys: {reason}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::LastPrekey => {
            let prekey = cbox.last_prekey()?;
            println!("{}\t{}", prekey.id(), prekey.to_base64());
        }
        Commands::Sessions => {
            for id in cbox.session_ids()? {
                println!("{id}");
            }
        }
        Commands::Encrypt {
            session,
            prekey,
            message,
        } => {
            let handle = match prekey {
                Some(prekey) => cbox.session_with_id_from_string_prekey(&session, &prekey),
                None => cbox.session_by_id(&session),
            };
            match handle {
                Ok(handle) => {
                    let ciphertext = handle.encrypt(message.as_bytes())?;
                    cbox.save_sessions_requiring_save()?;
                    println!("{}", STANDARD.encode(ciphertext));
                }
                Err(CryptoboxError::SessionNotFound(id)) => {
                    eprintln!("No session {id}. Pass the peer prekey with --prekey first.");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Decrypt { session, message } => {
            let ciphertext = STANDARD.decode(message.trim())?;
            match cbox.session_message_with_id(&session, &ciphertext) {
                Ok(received) => {
                    cbox.save_sessions_requiring_save()?;
                    println!("{}", String::from_utf8_lossy(&received.plaintext));
                }
                Err(err) if err.code().is_discardable() => {
                    eprintln!("Ignoring message: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::DeleteSession { session } => {
            cbox.delete_session_with_id(&session)?;
            println!("Deleted session: {session}");
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("Box: {cbox:?}");
        }
    }

    cbox.close()?;
    Ok(())
}
