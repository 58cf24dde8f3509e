mod terminal;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eid_updater::config::{AppInfo, Configuration, Settings};
use eid_updater::log::LogSink;
use eid_updater::pcsc::PcscLink;
use eid_updater::{Card, Outcome, Updater};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::terminal::Terminal;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Updater(#[from] eid_updater::Error),

    #[error("Failed to start the async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Parser)]
#[command(name = "eid-updater")]
#[command(about = "Renews the certificates of an ID card in a PC/SC reader")]
#[command(version)]
struct Args {
    /// Deployment configuration with the update endpoint and the pinned bundle
    #[arg(long, value_name = "PATH", default_value = "config.json")]
    config: PathBuf,

    /// Operator settings; defaults are used when the file does not exist
    #[arg(long, value_name = "PATH", default_value = "settings.json")]
    settings: PathBuf,

    /// Reader to use instead of the first one attached
    #[arg(long, value_name = "NAME")]
    reader: Option<String>,

    /// Language sent to the server, overriding the settings
    #[arg(long, value_name = "CODE")]
    language: Option<String>,

    /// Print the protocol traffic
    #[arg(long)]
    details: bool,

    /// List the attached readers and exit
    #[arg(long)]
    list_readers: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match start(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn start(args: Args) -> Result<ExitCode> {
    if args.list_readers {
        for reader in PcscLink::readers().map_err(eid_updater::Error::from)? {
            println!("{}", reader);
        }

        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(run(args));

    // A prompt still waiting for input must not hold the process.
    runtime.shutdown_background();

    result
}

async fn run(args: Args) -> Result<ExitCode> {
    let configuration = Configuration::load(&args.config).map_err(eid_updater::Error::from)?;
    let mut settings = Settings::load(&args.settings).map_err(eid_updater::Error::from)?;
    if let Some(language) = args.language {
        settings.language = Some(language);
    }

    let link = PcscLink::open(args.reader.as_deref()).map_err(eid_updater::Error::from)?;
    let card = Card::new(Box::new(link));

    let (log, mut lines) = LogSink::channel();
    let details = args.details;
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if details {
                println!("{}", line);
            }
        }
    });

    let app = AppInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("{}", app.user_agent());

    let terminal = Terminal::new();
    let updater = Updater::new(card, &terminal, configuration, settings, app, log);

    tokio::select! {
        result = updater.run() => {
            debug!("Run ended: {:?}", result);

            // Failures of the run were already shown by the terminal.
            Ok(match result {
                Ok(Outcome::Completed) => ExitCode::SUCCESS,
                Ok(_) | Err(_) => ExitCode::FAILURE,
            })
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Cancelled by the operator");

            Ok(ExitCode::FAILURE)
        }
    }
}
