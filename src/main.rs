//! fcopy - replicate local files onto N remote nodes
//!
//! The client only streams chunks to the first target; the targets
//! forward amongst themselves along a chain or binary tree installed at
//! setup time, so client egress stays O(size) instead of O(N * size).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info};

use fcopy::client::{ClientParams, FcopyClient};
use fcopy::localaddr::local_addrs;
use fcopy::sender::{
    chain_edges, tree_edges, FileSender, SendMethod, SenderParams, DEFAULT_CHUNK_SIZE,
};
use fcopy::target::{parse_target, read_target_list, validate_targets, RemoteTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SendMethodArg {
    Chain,
    Tree,
}

impl From<SendMethodArg> for SendMethod {
    fn from(arg: SendMethodArg) -> SendMethod {
        match arg {
            SendMethodArg::Chain => SendMethod::Chain,
            SendMethodArg::Tree => SendMethod::Tree,
        }
    }
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "fcopy",
    version,
    about = "Replicate files to many nodes over a chain or tree topology"
)]
struct Args {
    /// Files to send
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Add a target node (repeatable)
    #[arg(short = 't', long = "target", value_name = "HOST:PORT")]
    targets: Vec<String>,

    /// Read targets from a file, one host:port per line
    #[arg(long, value_name = "FILE")]
    target_list: Option<PathBuf>,

    /// Parallel send workers, clamped to [1, 900]
    #[arg(short, long, default_value_t = 16)]
    parallel: usize,

    /// Propagation topology across the targets
    #[arg(long, value_enum, default_value_t = SendMethodArg::Chain)]
    send_method: SendMethodArg,

    /// Throughput cap in MB/s; 0 disables
    #[arg(long, default_value_t = 0)]
    speed_limit: u64,

    /// Wait for servers to finish closing files (default)
    #[arg(long, overrides_with = "no_wait_close")]
    wait_close: bool,

    /// Reply to close requests before the server releases the file
    #[arg(long)]
    no_wait_close: bool,

    /// Open and read the source with O_DIRECT (default)
    #[arg(long, overrides_with = "no_direct_io")]
    direct_io: bool,

    /// Read the source through the page cache
    #[arg(long)]
    no_direct_io: bool,

    /// Reject duplicate targets and targets naming this host (default)
    #[arg(long, overrides_with = "no_check_self")]
    check_self: bool,

    /// Skip the duplicate/self target validation
    #[arg(long)]
    no_check_self: bool,

    /// Validate and print the transfer plan without sending
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Resolve an on-by-default `--x` / `--no-x` flag pair; the later flag
/// wins when both are given.
fn flag_on(yes: bool, no: bool) -> bool {
    yes || !no
}

fn gather_targets(args: &Args) -> Result<Vec<RemoteTarget>> {
    let mut targets = Vec::new();
    for arg in &args.targets {
        targets.push(parse_target(arg)?);
    }
    if let Some(list) = &args.target_list {
        targets.extend(read_target_list(list)?);
    }

    let local = if flag_on(args.check_self, args.no_check_self) {
        Some(local_addrs())
    } else {
        None
    };
    validate_targets(&targets, local.as_deref())?;

    Ok(targets)
}

fn validate_files(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let meta = std::fs::metadata(file)
            .with_context(|| format!("stat {}", file.display()))?;
        if !meta.is_file() {
            bail!("{} is not a regular file", file.display());
        }
    }
    Ok(())
}

fn print_plan(args: &Args, targets: &[RemoteTarget]) {
    println!("DRY RUN - no data will be sent");
    for (i, target) in targets.iter().enumerate() {
        println!("  target[{}] {}", i, target);
    }

    let edges = match args.send_method {
        SendMethodArg::Chain => chain_edges(targets.len()),
        SendMethodArg::Tree => tree_edges(targets.len()),
    };
    for (parent, children) in edges {
        for child in children {
            println!("  edge {} -> {}", targets[parent], targets[child]);
        }
    }

    for file in &args.files {
        let size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
        let chunks = size.div_ceil(DEFAULT_CHUNK_SIZE as u64);
        println!(
            "  file {} size:{} chunks:{}",
            file.display(),
            size,
            chunks
        );
    }
}

fn sender_params(args: &Args, targets: &[RemoteTarget], file: &PathBuf) -> SenderParams {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    SenderParams {
        file_path: file.clone(),
        partition: String::new(),
        remote_file_dir: ".".into(),
        remote_file_name: file_name,
        chunk_size: DEFAULT_CHUNK_SIZE,
        file_perm: 0,
        parallel: args.parallel,
        send_method: args.send_method.into(),
        direct_io: flag_on(args.direct_io, args.no_direct_io),
        wait_close: flag_on(args.wait_close, args.no_wait_close),
        speed_limit: args.speed_limit * 1024 * 1024,
        targets: targets.to_vec(),
    }
}

async fn upload_file(cli: &Arc<FcopyClient>, params: SenderParams) -> i32 {
    let file_path = params.file_path.clone();
    let mut sender = FileSender::new(cli.clone(), params);

    let mut error = sender.create_file().await;
    if error != 0 {
        error!("CreateFileError error:{}", error);
    } else {
        info!("CreateFileDone file:{}", file_path.display());

        error = sender.send_file().await;
        if error != 0 {
            error!("SendFileError error:{}", error);
        } else {
            info!("SendFileDone");
        }
        info!(
            "Send Cost:{:.4} Speed:{}",
            sender.send_cost().as_secs_f64(),
            sender.speed_str()
        );
    }

    let close_error = sender.close_file().await;
    if close_error != 0 {
        error!("CloseFileError error:{}", close_error);
    } else {
        info!("CloseFileDone");
    }

    if error != 0 {
        error
    } else {
        close_error
    }
}

fn exit_code(error: i32) -> ExitCode {
    ExitCode::from(error.unsigned_abs().min(255) as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp_micros()
        .init();

    let targets = match gather_targets(&args) {
        Ok(targets) => targets,
        Err(e) => {
            eprintln!("fcopy: {:#}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = validate_files(&args.files) {
        eprintln!("fcopy: {:#}", e);
        return ExitCode::from(1);
    }

    if args.dry_run {
        print_plan(&args, &targets);
        return ExitCode::SUCCESS;
    }

    let cli = Arc::new(FcopyClient::new(ClientParams {
        retry_max: 2,
        ..Default::default()
    }));

    for file in &args.files {
        let error = upload_file(&cli, sender_params(&args, &targets, file)).await;
        if error != 0 {
            return exit_code(error);
        }
    }

    ExitCode::SUCCESS
}
