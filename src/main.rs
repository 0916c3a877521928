mod analytics;
mod config;
mod data;
mod error;
mod normalizer;
mod predictor;
mod server;

use analytics::{PortfolioAnalyzer, PortfolioItem, round_to, volatility_features};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use config::{VALUE_PRECISION, VOLATILITY_WINDOW};
use data::{PriceSource, YahooPriceSource};
use normalizer::MarketDataNormalizer;
use predictor::ModelCell;
use server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Finsight: portfolio risk/return analytics and next-day volatility prediction",
    after_help = "EXAMPLES:
    # Analyze a two-stock portfolio over the last year
    cargo run --release -- --analyze AAPL:0.6,MSFT:0.4 --period 1y

    # Predict tomorrow's volatility from explicit features
    cargo run --release -- --predict 0.012,0.018

    # Predict from the latest market data for one symbol
    cargo run --release -- --predict-from SPY

    # Run the HTTP API
    cargo run --release -- --serve --port 8000"
)]
struct Args {
    /// Analyze a portfolio given as comma-separated SYMBOL:WEIGHT pairs (e.g., AAPL:0.6,MSFT:0.4)
    #[arg(long)]
    analyze: Option<String>,

    /// Lookback period passed to the market data provider (e.g., 1mo, 6mo, 1y)
    #[arg(long, default_value = config::DEFAULT_PERIOD)]
    period: String,

    /// Predict next-day volatility from RETURN,VOLATILITY
    #[arg(long, allow_hyphen_values = true)]
    predict: Option<String>,

    /// Predict next-day volatility from the latest closes of one symbol
    #[arg(long)]
    predict_from: Option<String>,

    /// Run the HTTP API
    #[arg(long)]
    serve: bool,

    /// HTTP port (overrides FINSIGHT_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the volatility model artifact (overrides FINSIGHT_MODEL_PATH)
    #[arg(long)]
    model_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("finsight=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    let mut settings = config::settings().clone();
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(path) = args.model_path.clone() {
        settings.model_path = path;
    }

    if let Some(ref spec) = args.analyze {
        let items = parse_portfolio(spec)?;
        let source = YahooPriceSource::new(&settings.yahoo_base_url)?;
        let analyzer = PortfolioAnalyzer::new(source);
        let result = analyzer.analyze(&items, &args.period).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if let Some(ref features) = args.predict {
        let (last_return, last_volatility) = parse_features(features)?;
        let model = ModelCell::from_path(settings.model_path.clone());
        print_prediction(&model, last_return, last_volatility)?;
        return Ok(());
    }

    if let Some(ref symbol) = args.predict_from {
        let source = YahooPriceSource::new(&settings.yahoo_base_url)?;
        let (last_return, last_volatility) =
            latest_features(MarketDataNormalizer::new(source), symbol, &args.period).await?;
        info!(
            "{}: last return {:.6}, rolling volatility {:.6}",
            symbol, last_return, last_volatility
        );
        let model = ModelCell::from_path(settings.model_path.clone());
        print_prediction(&model, last_return, last_volatility)?;
        return Ok(());
    }

    if args.serve {
        let source: Box<dyn PriceSource> =
            Box::new(YahooPriceSource::new(&settings.yahoo_base_url)?);
        let state = AppState {
            analyzer: Arc::new(PortfolioAnalyzer::new(source)),
            model: Arc::new(ModelCell::from_path(settings.model_path.clone())),
        };
        server::run_server(&settings, state).await?;
        return Ok(());
    }

    println!("Nothing to do. Run with --help for usage.");
    Ok(())
}

fn parse_portfolio(spec: &str) -> Result<Vec<PortfolioItem>> {
    spec.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (symbol, weight) = part
                .split_once(':')
                .ok_or_else(|| anyhow!("expected SYMBOL:WEIGHT, got '{}'", part.trim()))?;
            let weight: f64 = weight
                .trim()
                .parse()
                .with_context(|| format!("invalid weight for {}", symbol.trim()))?;
            Ok(PortfolioItem::new(symbol, weight))
        })
        .collect()
}

fn parse_features(spec: &str) -> Result<(f64, f64)> {
    let values = spec
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid feature list '{}'", spec))?;
    match values.as_slice() {
        [last_return, last_volatility] => Ok((*last_return, *last_volatility)),
        _ => bail!("expected RETURN,VOLATILITY, got {} values", values.len()),
    }
}

async fn latest_features<S: PriceSource>(
    normalizer: MarketDataNormalizer<S>,
    symbol: &str,
    period: &str,
) -> Result<(f64, f64)> {
    let instrument = symbol.trim().to_uppercase();
    let prices = normalizer.fetch(&[instrument], period).await?;
    Ok(volatility_features(&prices.column(0), VOLATILITY_WINDOW)?)
}

fn print_prediction(model: &ModelCell, last_return: f64, last_volatility: f64) -> Result<()> {
    let raw = model.predict(last_return, last_volatility)?;
    let body = serde_json::json!({
        "predicted_next_volatility": round_to(raw, VALUE_PRECISION),
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
