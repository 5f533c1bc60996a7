//! fcopyd - the fcopy replication server

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use tokio::signal::unix::{signal, SignalKind};

use fcopy::client::ClientParams;
use fcopy::config::FcopyConfig;
use fcopy::service::{Service, ServiceParams};

#[derive(Parser, Debug)]
#[command(name = "fcopyd", version, about = "fcopy replication server")]
struct Args {
    /// Config file (default: ~/.fcopy/fcopy.conf when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port; overrides the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Run in the background
    #[arg(short = 'g', long)]
    background: bool,
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    let path = PathBuf::from(home).join(".fcopy/fcopy.conf");
    path.is_file().then_some(path)
}

fn load_config(args: &Args) -> Result<FcopyConfig> {
    match args.config.clone().or_else(default_config_path) {
        Some(path) => FcopyConfig::load(&path),
        None => Ok(FcopyConfig::default()),
    }
}

fn init_logging(logfile: &str) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if !logfile.is_empty() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)
            .with_context(|| format!("open logfile {}", logfile))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                record.level(),
                record.args()
            )
        });
    }

    builder.init();
    Ok(())
}

fn service_params(config: &FcopyConfig, port: u16) -> ServiceParams {
    // A missing default-partition falls back to basedir, then the
    // working directory, so a bare `fcopyd -p PORT` serves something.
    let default_partition = if !config.default_partition.is_empty() {
        PathBuf::from(&config.default_partition)
    } else if !config.basedir.is_empty() {
        PathBuf::from(&config.basedir)
    } else {
        PathBuf::from(".")
    };

    ServiceParams {
        port,
        max_connections: config.srv_max_conn.max(1) as usize,
        keep_alive_timeout: config.srv_keep_alive_timeout as i64,
        receive_timeout: config.srv_receive_timeout as i64,
        peer_response_timeout: config.srv_peer_response_timeout as i64,
        request_size_limit: config.request_size_limit,
        direct_io: true,
        default_partition,
        partitions: config.partitions.clone(),
        cli: ClientParams {
            retry_max: config.cli_retry_max.max(0) as u32,
            send_timeout: config.cli_send_timeout as i64,
            receive_timeout: config.cli_receive_timeout as i64,
            keep_alive_timeout: config.cli_keep_alive_timeout as i64,
        },
    }
}

async fn run(params: ServiceParams) -> Result<()> {
    let service = Service::start(params).await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Signal SIGINT"),
        _ = sigterm.recv() => info!("Signal SIGTERM"),
    }

    service.stop().await;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let port = match args.port {
        Some(port) => port,
        None => match u16::try_from(config.port) {
            Ok(port) if port > 0 => port,
            _ => bail!("no listen port; pass --port or set `port` in the config"),
        },
    };

    init_logging(&config.logfile)?;

    if !config.basedir.is_empty() {
        std::env::set_current_dir(&config.basedir)
            .with_context(|| format!("chdir {}", config.basedir))?;
    }

    // Fork before the runtime spins up its worker threads.
    if args.background {
        nix::unistd::daemon(true, false).context("daemonise")?;
    }

    if !config.pidfile.is_empty() {
        std::fs::write(&config.pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("write pidfile {}", config.pidfile))?;
    }

    let params = service_params(&config, port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;
    let result = runtime.block_on(run(params));

    if !config.pidfile.is_empty() {
        let _ = std::fs::remove_file(&config.pidfile);
    }

    result
}
