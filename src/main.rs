//! Thin CLI binary exercising the `dedpaste_core` library end to end.
//!
//! Owns argument parsing, tracing initialization, and the on-disk layout
//! bootstrap; every actual operation is delegated to the library.

use clap::{Parser, Subcommand};
use dedpaste_core::store::{generate_self_keypair, KeyStore};
use dedpaste_core::{decrypt, encrypt, Config, DecryptOpts, RecipientSpec};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dedpaste-core", about = "Secure-messaging core for a command-line paste client")]
struct Cli {
    /// Override the on-disk layout root (defaults to `~/.dedpaste`).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt stdin for a recipient (or for yourself, with no recipient).
    Encrypt {
        /// Recipient identifiers: names, `gh:user`, `kb:user`, emails, key IDs, or a group name.
        recipients: Vec<String>,

        /// Force the OpenPGP path even for an RSA-natured recipient.
        #[arg(long)]
        pgp: bool,
    },

    /// Decrypt an envelope read from stdin.
    Decrypt {
        /// Armored OpenPGP private key to try if the host agent can't decrypt it.
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Passphrase for the private key above.
        #[arg(long)]
        passphrase: Option<String>,
    },

    /// Manage the local key store.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Add a friend's RSA public key (PEM) or OpenPGP public key (armored).
    AddFriend {
        name: String,
        /// Path to the key file; reads stdin if omitted.
        key_file: Option<PathBuf>,
    },

    /// List every stored key.
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let home = cli.home.unwrap_or_else(|| Config::default().home);
    let config = Config::from_env_and_file(&home);
    if let Err(e) = config.ensure_layout() {
        eprintln!("error: could not prepare {}: {e}", config.home.display());
        return ExitCode::FAILURE;
    }

    let _guard = init_tracing(&config);

    let store = KeyStore::new(config.clone());

    let result = match cli.command {
        Commands::Encrypt { recipients, pgp } => run_encrypt(&store, &config, recipients, pgp),
        Commands::Decrypt { private_key, passphrase } => run_decrypt(&store, &config, private_key, passphrase),
        Commands::Keys { action } => run_keys(&store, action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Logs to `<home>/logs/dedpaste.log`, rotated daily, with every line passed
/// through [`dedpaste_core::redact::redact`] before it reaches disk.
fn init_tracing(config: &Config) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(config.logs_dir(), "dedpaste.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let writer = dedpaste_core::redact::RedactingWriter::new(non_blocking);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    guard
}

fn read_stdin() -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

fn run_encrypt(
    store: &KeyStore,
    config: &Config,
    recipients: Vec<String>,
    force_pgp: bool,
) -> dedpaste_core::Result<()> {
    let plaintext = read_stdin()?;
    let fetchers = dedpaste_core::fetch::Fetchers::new();

    let spec = match recipients.len() {
        0 => RecipientSpec::SelfRecipient,
        1 => RecipientSpec::One(recipients.into_iter().next().unwrap()),
        _ => RecipientSpec::Many(recipients),
    };

    if store.get_self()?.is_none() {
        let (private_pem, public_pem) = generate_self_keypair()?;
        store.put_self(&private_pem, &public_pem)?;
        tracing::info!("generated a new self keypair");
    }

    let envelope = encrypt(store, &fetchers, config, &plaintext, &spec, force_pgp)?;
    io::stdout().write_all(&envelope)?;
    Ok(())
}

fn run_decrypt(
    store: &KeyStore,
    config: &Config,
    private_key: Option<PathBuf>,
    passphrase: Option<String>,
) -> dedpaste_core::Result<()> {
    let envelope_bytes = read_stdin()?;
    let private_key_armored = private_key.map(std::fs::read_to_string).transpose()?;

    let opts = DecryptOpts {
        private_key_armored,
        passphrase,
    };

    let message = decrypt(store, config, &envelope_bytes, &opts)?;
    io::stdout().write_all(&message.plaintext)?;
    Ok(())
}

fn run_keys(store: &KeyStore, action: KeysAction) -> dedpaste_core::Result<()> {
    match action {
        KeysAction::AddFriend { name, key_file } => {
            let key = match key_file {
                Some(path) => std::fs::read_to_string(path)?,
                None => String::from_utf8_lossy(&read_stdin()?).into_owned(),
            };
            let record = store.put_friend(&name, &key)?;
            println!("added {} ({})", record.id, record.fingerprint);
            Ok(())
        }
        KeysAction::List => {
            for record in store.load()? {
                println!(
                    "{:<10} {:<20} {}",
                    record.backend.as_str(),
                    record.id,
                    record.fingerprint
                );
            }
            Ok(())
        }
    }
}
