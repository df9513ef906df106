use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use s3_mirror::{run, Configuration, Summary};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "s3-mirror")]
#[command(about = "Mirror an S3 bucket prefix into a local directory", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config1.json")]
    config: PathBuf,

    /// Write a run-stats report next to the mirror on exit
    #[arg(long)]
    profiling: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("s3_mirror={}", log_level))
        .init();

    let cfg = match Configuration::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Cannot load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = cfg.validate() {
        eprintln!("❌ Error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("🚀 s3-mirror");
    info!("Bucket: {} (prefix {:?})", cfg.bucket_name, cfg.s3_prefix);
    info!("Mirror root: {}", cfg.download_path());
    info!(
        "Workers: {} downloader(s) on {} core(s)",
        cfg.downloaders(),
        cfg.num_cpu()
    );

    // numCPU is a scheduling hint; the runtime is sized to it.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.num_cpu())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cfg)) {
        Ok(summary) => {
            println!();
            info!("✅ {}", summary);
            if args.profiling {
                if let Err(e) = write_run_stats(&cfg, &summary) {
                    eprintln!("run-stats report failed: {}", e);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Appends one run's totals to `run-stats.txt` for later comparison.
fn write_run_stats(cfg: &Configuration, summary: &Summary) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("run-stats.txt")?;
    writeln!(file, "----------------------------------------------------------------")?;
    writeln!(
        file,
        "Bucket: {} with downloaders {}, cores {}, decompress {}",
        cfg.bucket_name,
        cfg.downloaders(),
        cfg.num_cpu(),
        cfg.decompress
    )?;
    writeln!(file, "Downloaded = {}", summary.downloaded)?;
    writeln!(file, "Failed = {}", summary.failed)?;
    writeln!(file, "Bytes = {}", summary.total_bytes)?;
    writeln!(file, "Elapsed = {:?}", summary.elapsed)?;
    writeln!(file, "Average = {:.0} B/s", summary.average_speed)?;
    Ok(())
}
