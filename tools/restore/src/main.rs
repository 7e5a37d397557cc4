//! Spill replay tool.
//!
//! Walks `{path_storage}/{port}/` for spill files, replays each file's
//! bytes over a local TCP connection to its listener port, then moves the
//! consumed file into the trash tree. Meant to run once after the broker
//! (or downstream) outage that caused the spill is fixed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use pipesrv::spill::{scan_storage, trash_file};

#[derive(Debug, Parser)]
#[command(name = "pipe-restore", about = "Replay spilled packets into local listeners")]
struct Args {
    /// Spill storage root
    #[arg(long, default_value = "./storage")]
    path_storage: PathBuf,

    /// Where consumed spill files are moved
    #[arg(long, default_value = "./trash")]
    path_trash: PathBuf,

    /// Log target: a file path, or the literal `stdout`
    #[arg(short = 'l', long, default_value = "stdout")]
    logs: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = common::logging::init(&args.logs) {
        eprintln!("logging setup failed: {e}");
        return ExitCode::FAILURE;
    }

    let timestamp = chrono::Utc::now().timestamp().to_string();
    let files = scan_storage(&args.path_storage);
    if files.is_empty() {
        info!("nothing to restore under {}", args.path_storage.display());
        return ExitCode::SUCCESS;
    }
    info!("found {} spill file(s)", files.len());

    let mut failures = 0usize;
    for file in files {
        let data = match std::fs::read(&file.path) {
            Ok(data) => data,
            Err(e) => {
                error!("cannot read {}: {e}", file.path.display());
                failures += 1;
                continue;
            }
        };
        match replay(file.port, &data).await {
            Ok(()) => {
                info!(
                    "replayed {} ({} bytes) into port {}",
                    file.path.display(),
                    data.len(),
                    file.port
                );
                if let Err(e) = trash_file(&file, &args.path_trash, &timestamp) {
                    warn!("replayed but not trashed: {e}");
                }
            }
            Err(e) => {
                error!("replay into port {} failed: {e}", file.port);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn replay(port: u16, data: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(("localhost", port)).await?;
    stream.write_all(data).await?;
    stream.shutdown().await
}
