mod progress_bar;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weatherdw_core::{
    db, ledger,
    queries::{self, AggregateQuery, Measure, Statistic},
    schema, ConnectionSettings, LoadError, LoadStatus, LoaderConfig, TracingProgress,
    WarehouseLoader,
};

use crate::progress_bar::ProgressBarSink;

#[derive(Parser, Debug)]
#[command(author, version, about = "Weather observation warehouse loader", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the warehouse tables if they are missing and verify their layout
    Schema,
    /// Load a delimited observation file into the warehouse
    Load(LoadArgs),
    /// Show row counts and recent load runs
    Summary(SummaryArgs),
    /// Aggregate one measurement per station or city
    Aggregate(AggregateArgs),
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Source file with one observation per row
    file: PathBuf,
    /// Fact rows per transaction (overrides the config file)
    #[arg(long)]
    batch_size: Option<usize>,
    /// TOML loader configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Start a new run instead of continuing an unfinished one
    #[arg(long)]
    no_resume: bool,
    /// Print the load report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SummaryArgs {
    /// Number of load runs to list
    #[arg(long, default_value_t = 10)]
    runs: i64,
}

#[derive(Args, Debug)]
struct AggregateArgs {
    #[arg(long, default_value = "tavg")]
    measure: String,
    /// avg, min or max
    #[arg(long, default_value = "avg")]
    stat: String,
    /// Defaults to the earliest year in the warehouse
    #[arg(long)]
    from_year: Option<i16>,
    /// Defaults to the latest year in the warehouse
    #[arg(long)]
    to_year: Option<i16>,
    #[arg(long, default_value_t = 1)]
    from_month: i16,
    #[arg(long, default_value_t = 12)]
    to_month: i16,
    #[arg(long)]
    country: Option<String>,
    /// Group by city instead of by station
    #[arg(long)]
    by_city: bool,
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Schema => {
            let pool = connect_pool(&LoaderConfig::default()).await?;
            schema::ensure_schema(&pool).await?;
            info!("Warehouse schema is in place");
            Ok(())
        }
        Command::Load(args) => run_load(args).await,
        Command::Summary(args) => run_summary(args).await,
        Command::Aggregate(args) => run_aggregate(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_pool(config: &LoaderConfig) -> Result<db::DbPool> {
    let settings = ConnectionSettings::from_env()
        .context("database settings (DATABASE_URL or WEATHERDW_DB_*) are invalid")?;
    let pool = db::connect(&settings, &config.retry).await?;
    Ok(pool)
}

async fn run_load(args: LoadArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_file(path)
            .with_context(|| format!("failed to read loader config {}", path.display()))?,
        None => LoaderConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.no_resume {
        config.resume = false;
    }
    config.validate()?;

    let pool = connect_pool(&config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next batch or dimension key");
            on_signal.cancel();
        }
    });

    let loader = WarehouseLoader::new(&pool, config).with_cancellation(cancel);
    let loader = if args.json {
        loader.with_progress(Arc::new(TracingProgress))
    } else {
        loader.with_progress(Arc::new(ProgressBarSink::new()))
    };

    let report = match loader.load(&args.file).await {
        Ok(report) => report,
        Err(LoadError::Cancelled { committed_rows }) => {
            bail!(
                "load cancelled with {committed_rows} fact rows committed; rerun the same command to resume"
            );
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to load {}", args.file.display()))
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match report.status {
        LoadStatus::AlreadyLoaded => println!(
            "{} was already loaded by run {} ({} rows); nothing to do",
            report.source_path, report.load_id, report.source_rows
        ),
        LoadStatus::Loaded | LoadStatus::Resumed => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Table", "Distinct keys", "Inserted", "Already present"]);
            for summary in [&report.date_dimension, &report.station_dimension]
                .into_iter()
                .flatten()
            {
                table.add_row(vec![
                    summary.dimension.table().to_string(),
                    summary.distinct_keys.to_string(),
                    summary.inserted.to_string(),
                    summary.existing.to_string(),
                ]);
            }
            if let Some(facts) = &report.facts {
                table.add_row(vec![
                    "weather_fact".to_string(),
                    "-".to_string(),
                    facts.rows_inserted.to_string(),
                    facts.skipped_rows.to_string(),
                ]);
            }
            let verb = if report.status == LoadStatus::Resumed {
                "Resumed"
            } else {
                "Loaded"
            };
            println!(
                "{verb} {} ({} rows, run {})",
                report.source_path, report.source_rows, report.load_id
            );
            println!("{table}");
        }
    }
    Ok(())
}

async fn run_summary(args: SummaryArgs) -> Result<()> {
    let pool = connect_pool(&LoaderConfig::default()).await?;
    schema::verify_schema(&pool).await?;

    let counts = queries::warehouse_counts(&pool).await?;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Table", "Rows"]);
    table.add_row(vec!["date_dimension".to_string(), counts.dates.to_string()]);
    table.add_row(vec!["station_dimension".to_string(), counts.stations.to_string()]);
    table.add_row(vec!["weather_fact".to_string(), counts.facts.to_string()]);
    println!("{table}");

    let runs = ledger::recent(&pool, args.runs).await?;
    if runs.is_empty() {
        println!("No load runs recorded");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Run", "Source", "Status", "Committed", "Started", "Error"]);
    for run in runs {
        table.add_row(vec![
            run.load_id.to_string(),
            run.source_path,
            run.status.as_str().to_string(),
            format!("{}/{}", run.committed_rows, run.total_rows),
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.error.unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn run_aggregate(args: AggregateArgs) -> Result<()> {
    let measure: Measure = args.measure.parse()?;
    let statistic: Statistic = args.stat.parse()?;

    let pool = connect_pool(&LoaderConfig::default()).await?;

    let (from_year, to_year) = match (args.from_year, args.to_year) {
        (Some(from), Some(to)) => (from, to),
        (from, to) => {
            let years = queries::available_years(&pool).await?;
            let (Some(first), Some(last)) = (years.first(), years.last()) else {
                bail!("the warehouse holds no dates yet; load a file first");
            };
            (from.unwrap_or(*first), to.unwrap_or(*last))
        }
    };

    let query = AggregateQuery {
        from_month: args.from_month,
        to_month: args.to_month,
        country: args.country,
        ..AggregateQuery::new(measure, statistic, from_year, to_year)
    };
    let value_header = format!("{measure} ({})", args.stat.to_ascii_lowercase());

    if args.by_city {
        let rows = queries::city_aggregates(&pool, &query).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec![
            "City".to_string(),
            "Country".to_string(),
            "Stations".to_string(),
            value_header,
            "Observations".to_string(),
        ]);
        for row in rows {
            table.add_row(vec![
                row.station_city,
                row.station_country,
                row.stations.to_string(),
                format_value(row.value),
                row.observations.to_string(),
            ]);
        }
        println!("{table}");
        return Ok(());
    }

    let rows = queries::station_aggregates(&pool, &query).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "Station".to_string(),
        "City".to_string(),
        "Country".to_string(),
        "Latitude".to_string(),
        "Longitude".to_string(),
        value_header,
        "Observations".to_string(),
    ]);
    for row in rows {
        table.add_row(vec![
            row.station_code,
            row.station_city,
            row.station_country,
            format!("{:.4}", row.latitude),
            format!("{:.4}", row.longitude),
            format_value(row.value),
            row.observations.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn format_value(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.2}"))
        .unwrap_or_else(|| "-".to_string())
}
