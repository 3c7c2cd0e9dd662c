//! `r2r` command-line front end.
//!
//! ```bash
//! r2r bridge hostA:/data/file.bin hostB:/backup/file.bin --username-dst deploy
//! ```
//!
//! Set `RUST_LOG=debug` (or pass `-vv`) for connection diagnostics.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::debug;
use tokio_util::sync::CancellationToken;

use r2r::transfer::DEFAULT_CHUNK_SIZE;
use r2r::{
    Bridge, BridgeBuilder, ErrorKind, HostKeyVerification, Phase, Progress, SshConnector, Strategy,
    TerminalPrompt,
};

#[derive(Parser, Debug)]
#[command(name = "r2r", about = "Copy a file directly between two remote hosts over SFTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy SRC to DST, both given as HOST_ALIAS:/path/to/file
    Bridge(BridgeArgs),
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
struct BridgeArgs {
    /// Source endpoint (HOST_ALIAS:/path/to/file)
    src: String,

    /// Destination endpoint (HOST_ALIAS:/path/to/file)
    dst: String,

    /// Username for the source host
    #[arg(long = "username-src")]
    username_src: Option<String>,

    /// Username for the destination host
    #[arg(long = "username-dst")]
    username_dst: Option<String>,

    /// SSH port for the source host (22 defers to ssh_config)
    #[arg(long = "port-src", default_value_t = 22)]
    port_src: u16,

    /// SSH port for the destination host (22 defers to ssh_config)
    #[arg(long = "port-dst", default_value_t = 22)]
    port_dst: u16,

    /// Private key for the source host
    #[arg(long = "identity-src")]
    identity_src: Option<PathBuf>,

    /// Private key for the destination host
    #[arg(long = "identity-dst")]
    identity_dst: Option<PathBuf>,

    /// Stream the file in chunks (default)
    #[arg(long, conflicts_with = "buffer")]
    stream: bool,

    /// Read the whole file into memory before writing
    #[arg(long)]
    buffer: bool,

    /// Chunk size in bytes when streaming
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Overlap reads and writes with up to DEPTH chunks in flight
    #[arg(long, value_name = "DEPTH")]
    pipeline: Option<usize>,

    /// Write to a temporary file and rename it into place on success
    #[arg(long)]
    atomic: bool,

    /// Connect and authentication timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    timeout: u64,

    /// Host key checking policy
    #[arg(long, value_enum, default_value_t = HostKeyPolicy::AcceptNew)]
    host_key_policy: HostKeyPolicy,

    /// known_hosts file to check and update
    #[arg(long, value_name = "PATH")]
    known_hosts: Option<PathBuf>,

    /// ssh_config file to read instead of ~/.ssh/config
    #[arg(long, value_name = "PATH")]
    ssh_config: Option<PathBuf>,

    /// Never prompt for passwords or passphrases
    #[arg(long)]
    batch: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// No progress line
    #[arg(short, long)]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum HostKeyPolicy {
    Strict,
    AcceptNew,
    Disabled,
}

impl From<HostKeyPolicy> for HostKeyVerification {
    fn from(policy: HostKeyPolicy) -> Self {
        match policy {
            HostKeyPolicy::Strict => HostKeyVerification::Strict,
            HostKeyPolicy::AcceptNew => HostKeyVerification::AcceptNew,
            HostKeyPolicy::Disabled => HostKeyVerification::Disabled,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("r2r {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Command::Bridge(args) => run_bridge(args).await,
    }
}

async fn run_bridge(args: BridgeArgs) -> ExitCode {
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let strategy = match (args.stream, args.buffer) {
        (_, true) => Strategy::Buffer,
        _ => Strategy::Stream,
    };

    let mut builder = BridgeBuilder::new()
        .source_port(args.port_src)
        .destination_port(args.port_dst)
        .strategy(strategy)
        .chunk_size(args.chunk_size)
        .timeout(Duration::from_secs(args.timeout))
        .host_key_verification(args.host_key_policy.into())
        .interactive(!args.batch)
        .atomic(args.atomic);

    if let Some(user) = &args.username_src {
        builder = builder.source_username(user);
    }
    if let Some(user) = &args.username_dst {
        builder = builder.destination_username(user);
    }
    if let Some(path) = &args.identity_src {
        builder = builder.source_identity(path);
    }
    if let Some(path) = &args.identity_dst {
        builder = builder.destination_identity(path);
    }
    if let Some(depth) = args.pipeline {
        builder = builder.pipeline(depth);
    }
    if let Some(path) = &args.known_hosts {
        builder = builder.known_hosts(path);
    }
    if let Some(path) = &args.ssh_config {
        builder = builder.ssh_config(path);
    }

    let options = match builder.build() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Transfer failed: {e}");
            return exit_code(e.kind());
        }
    };

    let bridge = Bridge::new(SshConnector, TerminalPrompt, options);
    let prepared = match bridge.prepare(&args.src, &args.dst) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Transfer failed: {e}");
            return exit_code(e.kind());
        }
    };

    // Installed after the prompts: Ctrl-C at a prompt still ends the process.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, cancelling transfer");
            on_signal.cancel();
        }
    });

    let mut progress = ProgressLine::new(!args.quiet && !args.json && std::io::stderr().is_terminal());
    let outcome = bridge
        .execute(prepared, &cancel, |p| progress.update(p))
        .await;
    progress.finish();

    match outcome {
        Ok(result) => {
            if args.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Failed to encode result: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!(
                    "Transferred {} -> {} ({} bytes)",
                    args.src, args.dst, result.bytes_transferred
                );
                for warning in &result.cleanup_warnings {
                    eprintln!("Warning: {warning}");
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Transfer failed: {e}");
            if e.kind() == ErrorKind::Transfer
                && e.phase() == Some(Phase::Transfer)
                && !args.atomic
            {
                eprintln!("Note: a partial file may remain at {}", args.dst);
            }
            exit_code(e.kind())
        }
    }
}

fn exit_code(kind: ErrorKind) -> ExitCode {
    let code = match kind {
        ErrorKind::Usage => 2,
        ErrorKind::Configuration => 3,
        ErrorKind::Authentication => 4,
        ErrorKind::Connection => 5,
        ErrorKind::Transfer => 6,
        ErrorKind::Cancelled => 130,
    };
    ExitCode::from(code)
}

/// Single-line progress display on stderr, redrawn at most every 100ms.
struct ProgressLine {
    enabled: bool,
    last_draw: Option<Instant>,
    drawn: bool,
}

impl ProgressLine {
    const INTERVAL: Duration = Duration::from_millis(100);

    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_draw: None,
            drawn: false,
        }
    }

    fn update(&mut self, progress: Progress) {
        if !self.enabled {
            return;
        }
        let done = progress.transferred >= progress.total;
        if !done && self.last_draw.is_some_and(|t| t.elapsed() < Self::INTERVAL) {
            return;
        }
        self.last_draw = Some(Instant::now());
        self.drawn = true;

        let mut stderr = std::io::stderr().lock();
        let _ = match progress.percent() {
            Some(pct) => write!(
                stderr,
                "\r{} / {} bytes ({:5.1}%)",
                progress.transferred, progress.total, pct
            ),
            None => write!(stderr, "\r{} bytes", progress.transferred),
        };
        let _ = stderr.flush();
    }

    fn finish(&mut self) {
        if self.drawn {
            eprintln!();
            self.drawn = false;
        }
    }
}
