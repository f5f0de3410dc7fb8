//! Entry point: argument parsing, logging, and the restart loop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dicom_vault::config::Configuration;
use dicom_vault::errors::VaultError;
use dicom_vault::plugins::PluginRegistry;
use dicom_vault::server::ServerContext;
use dicom_vault::{VaultResult, VAULT_VERSION};

/// Lightweight RESTful DICOM server for healthcare and medical research.
///
/// The CONFIGURATION argument can be a single file or a directory; in the
/// case of a directory, all the JSON files it contains are merged. Without
/// it, a set of default parameters is used.
#[derive(Debug, Parser)]
#[command(name = "dicom-vault", version = VAULT_VERSION)]
struct Args {
    /// Configuration file, or directory of JSON configuration files
    configuration: Option<PathBuf>,

    /// Print the supported error codes and exit
    #[arg(long)]
    errors: bool,

    /// Be verbose in logs
    #[arg(long)]
    verbose: bool,

    /// Highest verbosity in logs (for debug)
    #[arg(long)]
    trace: bool,

    /// Directory where to store the log files (stderr if not used)
    #[arg(long, value_name = "DIR")]
    logdir: Option<PathBuf>,

    /// Create a sample configuration file and exit
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Allow the server to upgrade the version of the database schema
    #[arg(long)]
    upgrade: bool,
}

fn print_errors() {
    println!("The error codes are:");
    for (code, name, description) in VaultError::enumerate() {
        println!("{:>8}  {:<30} {}", code, name, description);
    }
}

fn init_logging(args: &Args) -> VaultResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.trace {
            EnvFilter::new("trace")
        } else if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::FmtSubscriber::builder().with_env_filter(filter);

    match &args.logdir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("dicom-vault.log");
            let file = std::fs::File::create(&path).map_err(|_| {
                VaultError::CannotWriteFile {
                    path: path.display().to_string(),
                }
            })?;
            tracing::subscriber::set_global_default(
                builder.with_ansi(false).with_writer(std::sync::Mutex::new(file)).finish(),
            )
        }
        None => tracing::subscriber::set_global_default(builder.finish()),
    }
    .map_err(|e| VaultError::Internal {
        message: format!("cannot install the logger: {}", e),
    })
}

/// One full lifetime of the server. Returns `true` when a reset was
/// requested and the whole pipeline must be rebuilt.
async fn run_server(args: &Args) -> VaultResult<bool> {
    let config = Arc::new(Configuration::load(args.configuration.as_deref())?);

    // surface registration errors before anything touches the disk
    config.user_metadata()?;
    config.user_content_types()?;
    config.modalities()?;
    config.peers()?;

    let plugins = Arc::new(PluginRegistry::new());
    for path in config.get_list_of_strings("Plugins") {
        warn!(
            "Dynamic plugin loading is not available in this build, ignoring: {}",
            path
        );
    }

    let context = Arc::new(ServerContext::create(
        config.clone(),
        plugins,
        args.upgrade,
    )?);

    tokio::spawn(context.clone().run_stable_monitor());

    let mut servers = Vec::new();
    if config.get_bool("HttpServerEnabled", true) {
        let context = context.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = dicom_vault::rest::run_http_server(context).await {
                error!("HTTP server failed: {}", e);
            }
        }));
    } else {
        warn!("The HTTP server is disabled");
    }

    if config.get_bool("DicomServerEnabled", true) {
        let context = context.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = dicom_vault::dimse::run_dicom_server(context).await {
                error!("DICOM server failed: {}", e);
            }
        }));
    } else {
        warn!("The DICOM server is disabled");
    }

    {
        let context = context.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                context.stop();
            }
        });
    }

    info!("The server has started");
    let restart = context.wait_for_exit().await;

    context.finalize();
    for server in servers {
        let _ = server.await;
    }

    Ok(restart)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.errors {
        print_errors();
        return;
    }

    if let Some(path) = &args.config {
        if let Err(e) = std::fs::write(path, Configuration::default_configuration()) {
            eprintln!("Cannot write the sample configuration: {}", e);
            std::process::exit(-1);
        }
        println!("Sample configuration written to {}", path.display());
        return;
    }

    if let Err(e) = init_logging(&args) {
        eprintln!("{}", e);
        std::process::exit(-1);
    }

    info!("dicom-vault {} starting", VAULT_VERSION);

    loop {
        match run_server(&args).await {
            Ok(true) => {
                warn!("Restarting the server");
                continue;
            }
            Ok(false) => {
                info!("The server has stopped");
                break;
            }
            Err(e) => {
                error!("Uncaught exception, stopping now: {}", e);
                std::process::exit(-1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_surface() {
        let args = Args::try_parse_from([
            "dicom-vault",
            "--verbose",
            "--upgrade",
            "--logdir",
            "/tmp/logs",
            "/etc/dicom-vault",
        ])
        .unwrap();
        assert!(args.verbose);
        assert!(args.upgrade);
        assert_eq!(args.logdir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(args.configuration, Some(PathBuf::from("/etc/dicom-vault")));

        let args = Args::try_parse_from(["dicom-vault", "--errors"]).unwrap();
        assert!(args.errors);
    }
}
