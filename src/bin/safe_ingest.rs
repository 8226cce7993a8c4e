use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use sentinel_safe_ingest::aoi::AoiRegistry;
use sentinel_safe_ingest::app::{App, IngestResult, ProgressEvent, ProgressSink};
use sentinel_safe_ingest::catalog_index::{CatalogIndexWriter, ExistenceOracle, SqliteCatalogIndex};
use sentinel_safe_ingest::config::{ConfigLoader, Credentials, ResolvedConfig};
use sentinel_safe_ingest::copernicus::{CdseTokenClient, CopernicusCatalogClient, TokenProvider};
use sentinel_safe_ingest::domain::{AuthToken, CatalogRecord, parse_catalog_page};
use sentinel_safe_ingest::error::IngestError;
use sentinel_safe_ingest::fetcher::{AssetFetcher, ZipperHttpClient};
use sentinel_safe_ingest::graph::GraphApiClient;
use sentinel_safe_ingest::lock::IndexLocks;
use sentinel_safe_ingest::metadata::MetadataMergeStore;
use sentinel_safe_ingest::object_store::{FsObjectStore, ObjectStore};
use sentinel_safe_ingest::output::{JsonOutput, OutputMode};
use sentinel_safe_ingest::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "safe-ingest")]
#[command(about = "Ingest Sentinel-2 SAFE archives for an area of interest into object storage")]
#[command(version, author)]
struct Cli {
    /// Path to the JSON config (defaults to ./safe-ingest.json).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Manage areas of interest")]
    Aoi(AoiArgs),
    #[command(about = "Search the catalog for an AOI and ingest every new product")]
    Ingest(IngestArgs),
    #[command(about = "Ingest products listed in a catalog JSON response")]
    IngestRecords(IngestRecordsArgs),
    #[command(about = "List rows of the footprint index")]
    Footprints(FootprintArgs),
}

#[derive(Args)]
struct AoiArgs {
    #[command(subcommand)]
    command: AoiCommand,
}

#[derive(Subcommand)]
enum AoiCommand {
    #[command(about = "Register an AOI from a GeoJSON file")]
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        geojson: String,
    },
    #[command(about = "List registered AOIs")]
    List,
    #[command(about = "Search the catalog for a registered AOI without ingesting")]
    Search {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Args)]
struct IngestArgs {
    /// GeoJSON file with one or more polygons.
    #[arg(long, conflicts_with = "aoi", required_unless_present = "aoi")]
    geojson: Option<String>,

    /// Identifier of a registered AOI.
    #[arg(long)]
    aoi: Option<i64>,
}

#[derive(Args)]
struct IngestRecordsArgs {
    /// File holding an OData products response (`{"value": [...]}`).
    file: String,
}

#[derive(Args)]
struct FootprintArgs {
    /// Bounding box as `min_x,min_y,max_x,max_y`.
    #[arg(long, value_parser = parse_bbox)]
    bbox: Option<BBox>,
}

#[derive(Clone, Copy)]
struct BBox([f64; 4]);

fn parse_bbox(raw: &str) -> Result<BBox, String> {
    let values = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid bbox {raw:?}: {err}"))?;
    match values.as_slice() {
        [min_x, min_y, max_x, max_y] if min_x <= max_x && min_y <= max_y => {
            Ok(BBox([*min_x, *min_y, *max_x, *max_y]))
        }
        _ => Err(format!("bbox needs min_x,min_y,max_x,max_y, got {raw:?}")),
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::MissingCredential(_)
        | IngestError::InvalidAoi(_)
        | IngestError::InvalidRecord(_)
        | IngestError::InvalidFootprint(_)
        | IngestError::AoiNotFound(_) => 2,
        IngestError::DedupUnavailable(_)
        | IngestError::CatalogHttp(_)
        | IngestError::CatalogStatus { .. }
        | IngestError::AuthHttp(_)
        | IngestError::AuthStatus { .. }
        | IngestError::DownloadHttp(_)
        | IngestError::DownloadStatus { .. }
        | IngestError::GraphHttp(_)
        | IngestError::GraphStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Aoi(args) => {
            let app = build_app(&config, NoCredentials)?;
            match args.command {
                AoiCommand::Add { name, geojson } => {
                    let document = read_json(&geojson)?;
                    let result = app.register_aoi(&name, &document)?;
                    match output_mode {
                        OutputMode::Json => JsonOutput::print_aoi(&result).into_diagnostic()?,
                        OutputMode::Human => println!(
                            "registered AOI {} ({}) with {} polygon(s)",
                            result.id, result.name, result.polygons
                        ),
                    }
                }
                AoiCommand::List => {
                    let aois = app.list_aois()?;
                    match output_mode {
                        OutputMode::Json => JsonOutput::print_aois(&aois).into_diagnostic()?,
                        OutputMode::Human => {
                            for aoi in &aois {
                                println!("{}\t{}\t{}", aoi.id, aoi.aoi_name, aoi.created_at);
                            }
                        }
                    }
                }
                AoiCommand::Search { id } => {
                    let result = app.search_aoi(id, &StderrProgress)?;
                    match output_mode {
                        OutputMode::Json => JsonOutput::print_search(&result).into_diagnostic()?,
                        OutputMode::Human => {
                            for record in &result.records {
                                println!("{}\t{}", record.id, record.name);
                            }
                            println!("{} product(s)", result.records.len());
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Ingest(args) => {
            let tokens = CdseTokenClient::new(&config.endpoints.identity, Credentials::from_env()?)?;
            let app = build_app(&config, tokens)?;
            let result = match (args.geojson, args.aoi) {
                (Some(path), _) => app.ingest_geojson(&read_json(&path)?, &StderrProgress)?,
                (None, Some(id)) => app.ingest_aoi(id, &StderrProgress)?,
                (None, None) => return Err(miette::Report::msg("--geojson or --aoi is required")),
            };
            print_ingest(&result, output_mode)
        }
        Commands::IngestRecords(args) => {
            let records = read_records(&args.file)?;
            let tokens = CdseTokenClient::new(&config.endpoints.identity, Credentials::from_env()?)?;
            let app = build_app(&config, tokens)?;
            let result = app.ingest_records(records, &StderrProgress)?;
            print_ingest(&result, output_mode)
        }
        Commands::Footprints(args) => {
            let app = build_app(&config, NoCredentials)?;
            let list = app.footprints(args.bbox.map(|bbox| bbox.0))?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_footprints(&list).into_diagnostic()?,
                OutputMode::Human => {
                    for row in &list.rows {
                        println!("{}\t{}\t{}", row.id, row.name, row.local_blob_storage_path);
                    }
                    println!("{} footprint(s)", list.rows.len());
                }
            }
            Ok(())
        }
    }
}

fn build_app<T: TokenProvider>(
    config: &ResolvedConfig,
    tokens: T,
) -> Result<App<CopernicusCatalogClient, T>, IngestError> {
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.storage.object_root.clone()));
    let (oracle, writer): (Arc<dyn ExistenceOracle>, Arc<dyn CatalogIndexWriter>) =
        match &config.endpoints.graph_api {
            Some(url) => {
                let graph = Arc::new(GraphApiClient::new(url)?);
                let oracle: Arc<dyn ExistenceOracle> = graph.clone();
                let writer: Arc<dyn CatalogIndexWriter> = graph;
                (oracle, writer)
            }
            None => {
                let index = Arc::new(SqliteCatalogIndex::open(&config.storage.database)?);
                let oracle: Arc<dyn ExistenceOracle> = index.clone();
                let writer: Arc<dyn CatalogIndexWriter> = index;
                (oracle, writer)
            }
        };
    let source = Arc::new(ZipperHttpClient::new(&config.endpoints.zipper)?);
    let fetcher = AssetFetcher::new(
        source,
        Arc::clone(&store),
        config.storage.bucket.clone(),
        config.ingestion.retry.clone(),
    )
    .with_archive_verification(config.ingestion.verify_archives);
    let metadata = MetadataMergeStore::new(
        store,
        config.storage.bucket.clone(),
        config.storage.metadata_key.clone(),
        IndexLocks::new(),
    );
    let pipeline = Pipeline::new(
        oracle,
        writer,
        Arc::new(fetcher),
        Arc::new(metadata),
        config.ingestion.workers,
    )?;
    let search = CopernicusCatalogClient::new(&config.endpoints.catalog)?;
    let aois = AoiRegistry::open(&config.storage.database)?;
    Ok(App::new(
        search,
        tokens,
        Arc::new(pipeline),
        aois,
        config.ingestion.collection.clone(),
    ))
}

fn read_json(path: &str) -> miette::Result<Value> {
    let content = fs::read_to_string(path)
        .map_err(|err| IngestError::Filesystem(format!("{path}: {err}")))?;
    let value = serde_json::from_str(&content)
        .map_err(|err| IngestError::InvalidRecord(format!("{path}: {err}")))?;
    Ok(value)
}

fn read_records(path: &str) -> miette::Result<Vec<CatalogRecord>> {
    let document = read_json(path)?;
    Ok(parse_catalog_page(&document)?)
}

fn print_ingest(result: &IngestResult, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_ingest(result).into_diagnostic()?,
        OutputMode::Human => {
            let report = &result.report;
            println!("batch {}: {:?}", result.batch_id, report.state);
            println!("  candidates:       {}", report.candidates);
            println!("  already ingested: {}", report.skipped_existing.len());
            println!("  fetched:          {}", report.fetched.len());
            println!("  failed:           {}", report.failed.len());
            println!("  not started:      {}", report.not_started.len());
            println!("  indexed:          {}", report.indexed_count);
            for (id, reason) in &report.failures {
                println!("  ! {id}: {reason}");
            }
            if let Some(error) = &report.index_error {
                println!("  ! index: {error}");
            }
        }
    }
    Ok(())
}

struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

/// Token provider for commands that never download.
struct NoCredentials;

impl TokenProvider for NoCredentials {
    fn token(&self) -> Result<AuthToken, IngestError> {
        Err(IngestError::MissingCredential(
            sentinel_safe_ingest::config::USERNAME_ENV.to_string(),
        ))
    }
}
