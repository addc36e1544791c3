use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use vcm_eval::config::{self, CodecKind, EvalConfig};
use vcm_eval::error::EvalError;
use vcm_eval::{CancelToken, EXIT_FATAL, EXIT_OK, cache, exit_code, run_sweep};

/// Rate-accuracy sweeps of image and video codecs, scored by a downstream
/// vision model instead of a human viewer.
#[derive(Parser, Debug)]
#[command(name = "vcm-eval")]
#[command(about = "Evaluate codecs by the accuracy of a vision model on their reconstructions")]
#[command(long_about = "Compress every sample of a dataset at a list of operating points, run a
detection model on the reconstructions and record one (bits-per-pixel, accuracy) pair per point.
Results are written after every operating point and re-runs resume where they stopped.")]
struct Cli {
    /// Directory searched for `<base>.json` when the base is not built in
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG wins when set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run (or resume) a sweep
    Run {
        /// Base configuration: image-neural, image-external, video-external or a file name
        base: String,
        /// Dotted overrides, e.g. codec.operating_points=[22,27] misc.workers=4
        overrides: Vec<String>,
    },
    /// Print the merged and validated configuration
    ShowConfig { base: String, overrides: Vec<String> },
    /// Check that the dataset and codec binaries the configuration names exist
    CheckDeps { base: String, overrides: Vec<String> },
    /// Inspect or clean the bitstream cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Entry count and size per codec
    Stats {
        #[arg(long, default_value = "cache/bitstreams")]
        root: PathBuf,
    },
    /// Delete every cache entry below the root
    Clear {
        #[arg(long, default_value = "cache/bitstreams")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn init_logging(level: &str) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.parse().unwrap_or(LevelFilter::Info));
    builder.parse_default_env();
    builder.format(|buf, record| {
        writeln!(buf, "[{}] {}", record.level(), record.args())?;
        Ok(())
    });
    let _ = builder.try_init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config_dir = cli.config_dir.as_deref();
    match cli.command {
        Commands::Run { base, overrides } => {
            let config = match config::load(&base, config_dir, &overrides) {
                Ok(config) => config,
                Err(e) => return Ok(report_fatal(&e)),
            };
            run(config).await
        }
        Commands::ShowConfig { base, overrides } => {
            let config = match config::resolve(&base, config_dir, &overrides) {
                Ok(config) => config,
                Err(e) => return Ok(report_fatal(&e)),
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(EXIT_OK)
        }
        Commands::CheckDeps { base, overrides } => {
            let config = match config::resolve(&base, config_dir, &overrides) {
                Ok(config) => config,
                Err(e) => return Ok(report_fatal(&e)),
            };
            Ok(check_deps(&config))
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats { root } => {
                let stats = cache::stats(&root)
                    .with_context(|| format!("reading cache at {}", root.display()))?;
                println!("Cache: {}", root.display());
                for (codec, (entries, bytes)) in &stats.per_codec {
                    println!("  {:<24} {:>8} entries {:>14} bytes", codec, entries, bytes);
                }
                println!("Total: {} entries, {} bytes", stats.entries, stats.bytes);
                Ok(EXIT_OK)
            }
            CacheAction::Clear { root } => {
                let removed = cache::clear(&root)
                    .with_context(|| format!("clearing cache at {}", root.display()))?;
                println!("Removed {} entries from {}", removed, root.display());
                Ok(EXIT_OK)
            }
        },
    }
}

async fn run(config: EvalConfig) -> Result<i32> {
    let cancel = CancelToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after cleanup of the running sample");
            signal_token.cancel();
        }
    });

    let output = config.misc.output.clone();
    let outcome = tokio::task::spawn_blocking(move || run_sweep(config, cancel))
        .await
        .context("sweep worker panicked")?;

    match &outcome {
        Ok(result) => {
            println!();
            print!("{}", result.summary_table());
            let invalid = result.entries.iter().filter(|e| !e.is_valid()).count();
            if invalid > 0 {
                warn!("{} operating point(s) recorded as invalid", invalid);
            }
            info!("Results written to {}", output.display());
        }
        Err(e) => {
            report_fatal(e);
        }
    }
    Ok(exit_code(&outcome))
}

fn report_fatal(e: &EvalError) -> i32 {
    error!("{}", e);
    if let Some(hint) = e.recovery_suggestion() {
        error!("hint: {}", hint);
    }
    match e {
        EvalError::Cancelled { .. } => vcm_eval::EXIT_CANCELLED,
        _ => EXIT_FATAL,
    }
}

fn print_section(title: &str) {
    println!();
    println!("== {} ==", title);
}

/// `[OK]`/`[FAIL]` report of every path the configuration depends on.
fn check_deps(config: &EvalConfig) -> i32 {
    let problems = config.validate_environment();
    let failing: Vec<&str> = problems
        .iter()
        .filter_map(|p| match p {
            EvalError::Config { field, .. } => Some(field.as_str()),
            _ => None,
        })
        .collect();

    let mut checks: Vec<(&str, String)> = vec![
        ("dataset.root", config.dataset.root.display().to_string()),
        (
            "dataset.annotations",
            config.dataset.annotations_path().display().to_string(),
        ),
    ];
    match config.codec.kind {
        CodecKind::External => {
            let ext = &config.codec.external;
            checks.push(("codec.external.encoder", ext.encoder.display().to_string()));
            checks.push(("codec.external.decoder", ext.decoder.display().to_string()));
            if let Some(cfg) = &ext.config_file {
                checks.push(("codec.external.config_file", cfg.display().to_string()));
            }
        }
        CodecKind::Neural => {
            if let Some(dir) = &config.codec.neural.weights_dir {
                checks.push(("codec.neural.weights_dir", dir.display().to_string()));
            }
        }
    }

    print_section("Configured paths");
    for (field, value) in &checks {
        if failing.contains(field) {
            println!("[FAIL] {} ({})", field, value);
        } else {
            println!("[OK]   {} ({})", field, value);
        }
    }

    print_section("Summary");
    let failed = checks.iter().filter(|(f, _)| failing.contains(f)).count();
    println!("Passed: {}, Failed: {}", checks.len() - failed, failed);
    if failed > 0 {
        println!();
        for problem in &problems {
            println!("{}", problem);
            if let Some(hint) = problem.recovery_suggestion() {
                println!("  hint: {}", hint);
            }
        }
        return EXIT_FATAL;
    }
    EXIT_OK
}
