use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chartlab::application::analyzer::{AnalyzerConfig, VisibleChartAnalyzer, compute_features};
use chartlab::application::optimization::optimizer::FastOptimizer;
use chartlab::application::runner::background_runner::BackgroundRunner;
use chartlab::application::runner::events::RunnerEvent;
use chartlab::application::validation::walk_forward::{ValidationResult, WalkForwardValidator};
use chartlab::config::{Config, GridFile};
use chartlab::domain::indicators::candidate_space;
use chartlab::domain::market::candle::VisibleRange;
use chartlab::domain::market::regime::{RegimeDetector, RegimeSnapshot};
use chartlab::domain::market::timeframe::Timeframe;
use chartlab::infrastructure::cache::AnalyzerCache;
use chartlab::infrastructure::data::load_candles;
use chartlab::infrastructure::mock::SyntheticSource;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{Level, error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(author, version, about = "Walk-forward validation and fast parameter search for chart entry signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate optimizer selections on a candle CSV with walk-forward folds
    Validate {
        /// CSV file with timestamp,open,high,low,close,volume[,spread] rows
        #[arg(short, long)]
        csv: String,

        /// Symbol the series belongs to (default: CHARTLAB_SYMBOL)
        #[arg(short, long)]
        symbol: Option<String>,

        /// TOML file overriding indicator search ranges
        #[arg(long)]
        grid: Option<String>,

        /// Output JSON file for the full validation report
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Run one optimization pass over a candle CSV and print the winner
    Optimize {
        /// CSV file with timestamp,open,high,low,close,volume[,spread] rows
        #[arg(short, long)]
        csv: String,

        /// Symbol the series belongs to (default: CHARTLAB_SYMBOL)
        #[arg(short, long)]
        symbol: Option<String>,

        /// TOML file overriding indicator search ranges
        #[arg(long)]
        grid: Option<String>,
    },
    /// Stream background analyses of a synthetic candle feed
    Watch {
        /// Symbol to analyze (default: CHARTLAB_SYMBOL)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Chart timeframe: 1m, 5m, 15m, 1h, 4h or 1d (default: CHARTLAB_TIMEFRAME)
        #[arg(short, long)]
        timeframe: Option<String>,

        /// How long to run before shutting down
        #[arg(long, default_value = "30")]
        duration_secs: u64,

        /// Seed for the synthetic random walk
        #[arg(long, default_value = "42")]
        feed_seed: u64,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Validate {
            csv,
            symbol,
            grid,
            output,
        } => run_validate(&config, &csv, symbol, grid.as_deref(), output.as_deref()),
        Commands::Optimize { csv, symbol, grid } => {
            run_optimize(&config, &csv, symbol, grid.as_deref())
        }
        Commands::Watch {
            symbol,
            timeframe,
            duration_secs,
            feed_seed,
        } => run_watch(&config, symbol, timeframe, duration_secs, feed_seed),
    }
}

/// Builds the optimizer for one-shot commands, with grid-file range
/// overrides applied when requested.
fn build_optimizer(config: &Config, grid: Option<&str>) -> Result<FastOptimizer> {
    let optimizer = FastOptimizer::new(config.optimizer);
    let Some(path) = grid else {
        return Ok(optimizer);
    };
    info!("Loading grid overrides from: {}", path);
    let grid = GridFile::load(path)?;
    let mut space = candidate_space();
    grid.apply(&mut space);
    Ok(optimizer.with_space(space))
}

fn run_validate(
    config: &Config,
    csv: &str,
    symbol: Option<String>,
    grid: Option<&str>,
    output: Option<&str>,
) -> Result<()> {
    let symbol = symbol.unwrap_or_else(|| config.symbol.clone());
    let candles = load_candles(Path::new(csv), &symbol)?;

    let optimizer = build_optimizer(config, grid)?;
    let validator = WalkForwardValidator::new(config.validation.clone()).with_optimizer(optimizer);

    let snapshot = RegimeDetector::default().detect(&candles);
    let features = compute_features(&candles);
    let result = validator.validate(&candles, snapshot.regime, Some(&features));

    print_validation_report(&symbol, &snapshot, &result);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(path, json).context(format!("Writing report to {}", path))?;
        info!("Report written to {}", path);
    }
    Ok(())
}

fn print_validation_report(symbol: &str, snapshot: &RegimeSnapshot, result: &ValidationResult) {
    println!("{}", "=".repeat(80));
    println!("📊 WALK-FORWARD VALIDATION - {}", symbol);
    println!(
        "Regime: {} (confidence {:.2}) | Seed: {} | {:.0}ms",
        snapshot.regime, snapshot.confidence, result.seed_used, result.total_time_ms
    );
    println!("{}", "=".repeat(80));

    for fold in &result.folds {
        let set_desc = fold
            .best_set
            .as_ref()
            .map_or_else(|| "no valid set".to_string(), |set| set.describe());
        println!(
            "Fold {}: train [{}, {}) score {:.4} ({} trades) | test [{}, {}) score {:.4} ({} trades)",
            fold.fold_idx,
            fold.train_range.0,
            fold.train_range.1,
            fold.train_score,
            fold.train_trades,
            fold.test_range.0,
            fold.test_range.1,
            fold.test_score,
            fold.test_trades,
        );
        println!("        {}", set_desc);
    }

    println!("{}", "-".repeat(80));
    println!(
        "Mean score: train {:.4} / test {:.4} (ratio {:.2})",
        result.mean_train_score, result.mean_test_score, result.mean_train_test_ratio
    );
    println!(
        "Out of sample: {} trades, win rate {:.1}%, profit factor {:.2}",
        result.total_test_trades,
        result.oos_win_rate * 100.0,
        result.oos_profit_factor
    );
    if result.is_valid {
        println!("✅ VALID - selections hold up out of sample");
    } else {
        println!("❌ NOT VALID");
        for reason in &result.failure_reasons {
            println!("   - {}", reason);
        }
    }
    println!("{}", "=".repeat(80));
}

fn run_optimize(
    config: &Config,
    csv: &str,
    symbol: Option<String>,
    grid: Option<&str>,
) -> Result<()> {
    let symbol = symbol.unwrap_or_else(|| config.symbol.clone());
    let candles = load_candles(Path::new(csv), &symbol)?;

    let optimizer = build_optimizer(config, grid)?;
    let snapshot = RegimeDetector::default().detect(&candles);
    let features = compute_features(&candles);

    let seed = config
        .validation
        .seed
        .unwrap_or_else(|| rand::rng().random());
    let mut rng = StdRng::seed_from_u64(seed);
    let started = Instant::now();
    let result = optimizer.optimize(&candles, snapshot.regime, Some(&features), &mut rng);
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    println!("{}", "=".repeat(80));
    println!(
        "🔍 PARAMETER SEARCH - {} ({} bars, {} regime, seed {})",
        symbol,
        candles.len(),
        snapshot.regime,
        seed
    );
    println!("{}", "=".repeat(80));
    match &result.best_set {
        Some(set) => {
            println!("Best set:   {}", set.describe());
            println!("Score:      {:.4}", result.best_score);
            println!("Entries:    {}", result.entries.len());
            println!(
                "Candidates: {} tried in {:.0}ms",
                result.candidates_tried, elapsed_ms
            );
        }
        None => {
            println!(
                "❌ No candidate reached {} trades ({} tried in {:.0}ms)",
                config.optimizer.min_trades, result.candidates_tried, elapsed_ms
            );
        }
    }
    println!("{}", "=".repeat(80));
    Ok(())
}

fn run_watch(
    config: &Config,
    symbol: Option<String>,
    timeframe: Option<String>,
    duration_secs: u64,
    feed_seed: u64,
) -> Result<()> {
    let symbol = symbol.unwrap_or_else(|| config.symbol.clone());
    let timeframe = match timeframe {
        Some(s) => Timeframe::from_str(&s)?,
        None => config.timeframe,
    };

    let source = Arc::new(SyntheticSource::new(feed_seed));
    let cache = Arc::new(AnalyzerCache::default());
    let analyzer = Arc::new(VisibleChartAnalyzer::new(
        source,
        cache,
        AnalyzerConfig {
            use_optimizer: config.runner.use_optimizer,
            validation: config.validation.clone(),
            filter: config.filter.clone(),
            optimizer: config.optimizer,
        },
    ));

    let runner = BackgroundRunner::new(analyzer, config.runner.clone());
    let events = runner.subscribe();
    runner.start();

    // The most recent hour of the feed.
    let now = chrono::Utc::now().timestamp();
    let range = VisibleRange::new(now - 3600, now);
    runner.request_analysis(range, &symbol, timeframe, true);

    info!(
        "Watching {} {} for {}s (re-analysis every {:.0}s)",
        symbol, timeframe, duration_secs, config.runner.reanalyze_interval_sec
    );
    let deadline = Instant::now() + Duration::from_secs(duration_secs);
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(RunnerEvent::Result(result)) => {
                info!(
                    "Analysis: {} entries, {} regime, {:.0}ms",
                    result.entries.len(),
                    result.regime.regime,
                    result.elapsed_ms
                );
            }
            Ok(RunnerEvent::NewEntry(entry)) => {
                info!(
                    "New entry: {} {} @ {:.5} (ts {})",
                    entry.side, entry.source, entry.price, entry.timestamp
                );
            }
            Ok(RunnerEvent::RegimeChange { from, to }) => {
                info!("Regime change: {} -> {}", from, to);
            }
            Ok(RunnerEvent::Error(message)) => {
                error!("Analysis failed: {}", message);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    runner.stop();
    let metrics = runner.metrics();
    println!("{}", "=".repeat(80));
    println!(
        "📈 {} analyses | avg {:.0}ms | max {:.0}ms | cache hit rate {:.0}% | {} overflows",
        metrics.total_analyses,
        metrics.avg_time_ms,
        metrics.max_time_ms,
        metrics.cache_hit_rate * 100.0,
        metrics.queue_overflows
    );
    println!("{}", "=".repeat(80));
    Ok(())
}
