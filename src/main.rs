use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pv_site_forecast::{api, config, eval, forecast, ml, telemetry};
use config::Config;
use pv_site_forecast::domain::{parse_timestamp, ModelKind, NwpSource, PvSite, DEFAULT_ORIENTATION_DEG, DEFAULT_TILT_DEG};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

#[derive(Parser)]
#[command(name = "pv-site-forecast", version, about = "PV site power forecasts from NWP and live inverter data")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API (default)
    Serve,
    /// Forecast one site and print JSON
    Forecast {
        #[command(flatten)]
        site: SiteArgs,
        /// Forecast time, defaults to now
        #[arg(long)]
        ts: Option<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Write repeated forecasts for one site to CSV
    ForecastCsv {
        #[arg(long)]
        site_name: String,
        #[command(flatten)]
        site: SiteArgs,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value_t = 1)]
        freq_hours: i64,
        #[command(flatten)]
        model: ModelArgs,
        /// Output directory, defaults to `forecast.csv_output_dir`
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Score forecasts against measured generation
    Eval {
        /// CSV of `pv_id,timestamp`
        #[arg(long)]
        testset: PathBuf,
        /// CSV of `pv_id,latitude,longitude,capacity[,tilt,orientation]`
        #[arg(long)]
        metadata: PathBuf,
        /// CSV of `pv_id,timestamp,power_kw`
        #[arg(long)]
        pv: PathBuf,
        /// Saved Open-Meteo responses; live API when absent
        #[arg(long)]
        nwp_dir: Option<PathBuf>,
        /// Write matched rows here
        #[arg(long)]
        results: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Args)]
struct SiteArgs {
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    /// kWp
    #[arg(long)]
    capacity: f64,
    #[arg(long, default_value_t = DEFAULT_TILT_DEG)]
    tilt: f64,
    #[arg(long, default_value_t = DEFAULT_ORIENTATION_DEG)]
    orientation: f64,
}

impl SiteArgs {
    fn site(&self) -> Result<PvSite> {
        let site = PvSite::new(self.lat, self.lon, self.capacity).with_panel(self.tilt, self.orientation);
        site.validate().context("invalid site")?;
        Ok(site)
    }
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long)]
    model: Option<ModelKind>,
    #[arg(long)]
    nwp: Option<NwpSource>,
}

fn timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_timestamp(raw).with_context(|| format!("unrecognised timestamp `{raw}`"))
}

async fn engine(cfg: &Config) -> Result<forecast::ForecastEngine> {
    let models = ml::ModelRegistry::from_config(&cfg.models).await;
    if models.kinds().await.is_empty() {
        warn!("no models loaded, every forecast will fail until one is available");
    }
    let weather = Arc::new(forecast::OpenMeteoClient::new(&cfg.weather)?);
    Ok(forecast::ForecastEngine::new(weather, models, cfg))
}

async fn serve(cfg: Config) -> Result<()> {
    let engine = engine(&cfg).await?;
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!(
            "WARNING: Server binding to 0.0.0.0 - service will be accessible from network! \
            For production, bind to 127.0.0.1 unless behind a firewall/reverse proxy."
        );
    }

    let app = api::router(api::AppState::new(cfg, engine));
    info!(%addr, "starting PV site forecast service");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);
    match command {
        Command::Serve => telemetry::init_tracing(),
        _ => telemetry::init_cli_tracing(),
    }

    let cfg = Config::load()?;

    match command {
        Command::Serve => serve(cfg).await,
        Command::Forecast { site, ts, model } => {
            let site = site.site()?;
            let ts = ts.as_deref().map(timestamp).transpose()?;
            let engine = engine(&cfg).await?;
            let forecast = engine.run_forecast(&site, ts, model.model, model.nwp, None).await?;
            let body = serde_json::json!({
                "timestamp": forecast.init_time.format(pv_site_forecast::domain::TIMESTAMP_FORMAT).to_string(),
                "predictions": { "power_kw": forecast.to_map() },
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Command::ForecastCsv { site_name, site, start, end, freq_hours, model, out_dir } => {
            let job = forecast::ForecastCsvJob {
                site_name,
                site: site.site()?,
                start: timestamp(&start)?,
                end: timestamp(&end)?,
                freq_hours,
                model: model.model,
                nwp_source: model.nwp,
            };
            let engine = engine(&cfg).await?;
            let out_dir = out_dir.unwrap_or_else(|| cfg.forecast.csv_output_dir.clone());
            let path = forecast::write_out_forecasts(&engine, &job, &out_dir).await?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Eval { testset, metadata, pv, nwp_dir, results, concurrency, model } => {
            let models = ml::ModelRegistry::from_config(&cfg.models).await;
            let nwp = match nwp_dir {
                Some(dir) => eval::NwpInput::Directory(dir),
                None => eval::NwpInput::Live(Arc::new(forecast::OpenMeteoClient::new(&cfg.weather)?)),
            };
            let evaluator = eval::Evaluator::new(models, cfg, nwp)
                .with_model(model.model, model.nwp)
                .with_concurrency(concurrency);
            let report = evaluator.run_files(&testset, &metadata, &pv).await?;
            if let Some(path) = results {
                report
                    .write_rows_csv(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
