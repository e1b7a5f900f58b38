use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod address;
mod app;
mod archive;
mod config;
mod error;
mod mail;
mod resolver;

use app::{App, GetRequest, Outcome};
use archive::MboxReader;
use config::Config;
use error::BackupError;
use mail::imap::ImapConnector;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the configuration file (created with defaults when missing)
    #[arg(short, long, env = "MAILBAK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up one mailbox into an mbox file
    Get {
        /// Account email address
        #[arg(short, long, default_value = "mail@example.com")]
        email: String,

        /// Mailbox to capture
        #[arg(short, long, default_value = "inbox")]
        mailbox: String,

        /// Directory the mbox file is written to
        #[arg(short, long, default_value = "/tmp")]
        location: PathBuf,

        #[arg(long, env = "MAILBAK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// List the mailboxes of an account
    Mailboxes {
        #[arg(short, long)]
        email: String,

        #[arg(long, env = "MAILBAK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Read an mbox file back and count its records
    Verify {
        file: PathBuf,

        /// Print sender, date and subject of every record
        #[arg(short, long)]
        list: bool,
    },
}

fn tracer() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailbak=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn password_supplier(given: Option<String>) -> impl FnOnce() -> error::Result<String> {
    move || match given {
        Some(p) => Ok(p),
        None => rpassword::prompt_password("  * Enter your password: ").map_err(BackupError::Credentials),
    }
}

/// Resolves on Ctrl-C; never resolves when the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("no Ctrl-C handler: {e}");
        std::future::pending::<()>().await;
    }
    eprintln!("  ! interrupted, closing archive");
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p,
        None => Config::default_path()?,
    };
    let (cfg, created) = Config::load_or_create(&path)?;
    if created {
        tracing::info!("wrote default configuration to {}", path.display());
    }
    Ok(cfg)
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_config(args.config)?;
    let connector = ImapConnector {
        io_timeout: config.backup.fetch_timeout(),
    };

    match args.command {
        Command::Get {
            email,
            mailbox,
            location,
            password,
        } => {
            let app = App::new(connector, &config);
            let req = GetRequest {
                email,
                mailbox,
                location,
            };
            match app.backup(&req, password_supplier(password), interrupted()).await? {
                Outcome::Completed(summary) => {
                    println!(
                        "  * Wrote {} of {} messages to {}",
                        summary.written,
                        summary.total,
                        summary.path.display()
                    );
                }
                Outcome::MailboxNotFound(name) => {
                    println!("  ! {}", BackupError::MailboxNotFound(name));
                    println!("exiting");
                }
            }
        }
        Command::Mailboxes { email, password } => {
            let app = App::new(connector, &config);
            for m in app.mailboxes(&email, password_supplier(password)).await? {
                if m.selectable {
                    println!("{}", m.name);
                } else {
                    println!("{} (not selectable)", m.name);
                }
            }
        }
        Command::Verify { file, list } => {
            let mut records = 0usize;
            for r in MboxReader::open(&file)? {
                let r = r?;
                records += 1;
                if list {
                    let subject = r
                        .headers
                        .iter()
                        .find(|h| h.key.eq_ignore_ascii_case("Subject"))
                        .map(|h| String::from_utf8_lossy(&h.value).into_owned())
                        .unwrap_or_default();
                    println!("{records:>6}  {}  {}  {subject}", r.date, r.sender);
                }
            }
            println!("{}: {records} records", file.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracer();

    let args = Args::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("could not start the runtime: {e}");
            println!("exiting");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async {
        match run(args).await {
            Ok(code) => code,
            Err(e) => {
                println!("{e:#}");
                println!("exiting");
                ExitCode::FAILURE
            }
        }
    });

    // an abandoned fetch may still be blocked on its socket
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    code
}
