//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use cellforge_core::{
    AutoDatasetParams, AutoDatasetRunner, CancelSignal, ExecutorConfig, GenerationEvent,
    HttpEmbedder, IndexSource, Indexer, IndexerConfig, ModelClient, OpenAiCompatClient,
    Orchestrator, PipelineEvent, PipelineStep, Retriever, RowRange, RunState, SerperSearch,
    SourceLimits, SourcePipeline,
};
use cellforge_scrape::{BrowserPool, ScrapeOptions, Scraper};
use cellforge_shared::{AppConfig, Cell, ColumnId, DatasetId, init_config, load_config};
use cellforge_storage::Storage;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Cellforge — fill dataset columns with model-generated cells.
#[derive(Parser)]
#[command(
    name = "cellforge",
    version,
    about = "Generate dataset cells with language models, optionally grounded in web sources.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate the cells of a column.
    Generate {
        /// Column ID.
        #[arg(long)]
        column: String,

        /// First row (defaults to the column's process).
        #[arg(long)]
        offset: Option<u32>,

        /// Number of rows (defaults to the column's process).
        #[arg(long)]
        limit: Option<u32>,

        /// Print every cell update as a JSON line.
        #[arg(long)]
        json: bool,
    },

    /// Design, create, and populate a dataset from a request.
    Auto {
        /// What the dataset should contain.
        instruction: String,

        /// Ground the dataset in web search results.
        #[arg(long)]
        search: bool,

        /// Search queries to derive (defaults to config).
        #[arg(long)]
        max_queries: Option<usize>,

        /// Sources to scrape (defaults to config).
        #[arg(long)]
        max_sources: Option<usize>,

        /// Model ID (defaults to config).
        #[arg(long)]
        model: Option<String>,

        /// Inference provider (defaults to config).
        #[arg(long)]
        provider: Option<String>,
    },

    /// Scrape a page and print its main content as Markdown.
    Scrape {
        url: String,
    },

    /// Scrape pages into a dataset's index.
    Index {
        /// Dataset ID.
        dataset: String,

        /// Pages to index.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Replace rows of pages already indexed.
        #[arg(long)]
        force: bool,
    },

    /// Search a dataset's index.
    Query {
        /// Dataset ID.
        dataset: String,

        query: String,
    },

    /// List datasets and their columns.
    List,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "cellforge=info",
        1 => "cellforge=debug",
        _ => "cellforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Generate {
            column,
            offset,
            limit,
            json,
        } => cmd_generate(&column, RowRange { offset, limit }, json).await,
        Command::Auto {
            instruction,
            search,
            max_queries,
            max_sources,
            model,
            provider,
        } => {
            let config = load_config()?;
            let mut params = AutoDatasetParams::new(instruction, &config);
            params.search_enabled = search;
            if let Some(n) = max_queries {
                params.max_search_queries = n.max(1);
            }
            if let Some(n) = max_sources {
                params.max_sources = n;
            }
            if let Some(model) = model {
                params.model_id = model;
            }
            if let Some(provider) = provider {
                params.provider_id = provider;
            }
            cmd_auto(config, params).await
        }
        Command::Scrape { url } => cmd_scrape(&url).await,
        Command::Index {
            dataset,
            urls,
            force,
        } => cmd_index(&dataset, &urls, force).await,
        Command::Query { dataset, query } => cmd_query(&dataset, &query).await,
        Command::List => cmd_list().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared services
// ---------------------------------------------------------------------------

/// Long-lived handles built once per command.
struct Services {
    config: AppConfig,
    storage: Arc<Storage>,
    pool: Arc<BrowserPool>,
}

impl Services {
    async fn open(config: AppConfig) -> Result<Self> {
        let storage = Storage::open(&config.storage.database_path()).await?;
        Ok(Self {
            config,
            storage: Arc::new(storage),
            pool: Arc::new(BrowserPool::new()),
        })
    }

    fn scraper(&self) -> Scraper {
        Scraper::new(self.pool.clone(), ScrapeOptions::from(&self.config.scrape))
    }

    fn model(&self) -> Result<Arc<OpenAiCompatClient>> {
        Ok(Arc::new(OpenAiCompatClient::from_config(&self.config.inference)?))
    }

    fn indexer(&self) -> Result<Indexer> {
        let embedder = Arc::new(HttpEmbedder::from_config(&self.config.embedding)?);
        Ok(Indexer::new(
            self.storage.clone(),
            embedder,
            IndexerConfig::from(&self.config),
        ))
    }

    fn sources(&self, model: Arc<dyn ModelClient>) -> Result<SourcePipeline> {
        let search = Arc::new(SerperSearch::from_config(&self.config.search)?);
        let embedder = Arc::new(HttpEmbedder::from_config(&self.config.embedding)?);
        Ok(SourcePipeline::new(
            model,
            search,
            self.scraper(),
            Indexer::new(
                self.storage.clone(),
                embedder.clone(),
                IndexerConfig::from(&self.config),
            ),
            Retriever::new(self.storage.clone(), embedder),
            SourceLimits::from(&self.config),
        ))
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}

/// A signal cancelled by the first Ctrl-C.
fn cancel_on_interrupt() -> CancelSignal {
    let cancel = CancelSignal::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            signal.cancel();
        }
    });
    cancel
}

fn spinner() -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    Ok(spinner)
}

fn parse_dataset_id(raw: &str) -> Result<DatasetId> {
    raw.parse()
        .map_err(|e| eyre!("invalid dataset id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_generate(column: &str, range: RowRange, json: bool) -> Result<()> {
    let column_id: ColumnId = column
        .parse()
        .map_err(|e| eyre!("invalid column id '{column}': {e}"))?;
    let services = Services::open(load_config()?).await?;
    let model = services.model()?;

    let target = services
        .storage
        .get_column(column_id)
        .await?
        .ok_or_else(|| eyre!("column {column_id} not found"))?;
    let search_enabled = target.process.as_ref().is_some_and(|p| p.search_enabled);

    let mut orchestrator = Orchestrator::new(
        services.storage.clone(),
        model.clone(),
        ExecutorConfig::from(&services.config),
    );
    if search_enabled {
        orchestrator = orchestrator.with_sources(Arc::new(services.sources(model)?));
    }

    info!(column = %target.name, ?range, "generating cells");
    let cancel = cancel_on_interrupt();
    let (tx, mut rx) = mpsc::channel(64);
    let generate = async {
        let tx = tx;
        orchestrator
            .generate_cells(column_id, range, &cancel, &tx)
            .await
    };
    let print = async {
        while let Some(GenerationEvent::Cell(cell)) = rx.recv().await {
            if json {
                match serde_json::to_string(&cell) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "could not encode cell"),
                }
            } else if !cell.generating {
                print_cell(&cell);
            }
        }
    };
    let (state, ()) = tokio::join!(generate, print);
    services.shutdown().await;

    match state? {
        RunState::Completed => eprintln!("Done."),
        RunState::Cancelled => eprintln!("Cancelled."),
        other => return Err(eyre!("generation ended as {other:?}")),
    }
    Ok(())
}

fn print_cell(cell: &Cell) {
    match (&cell.error, &cell.value) {
        (Some(error), _) => println!("[{}] error: {error}", cell.row_index),
        (None, Some(value)) => println!("[{}] {}", cell.row_index, value.trim()),
        (None, None) => println!("[{}] (empty)", cell.row_index),
    }
}

async fn cmd_auto(config: AppConfig, params: AutoDatasetParams) -> Result<()> {
    let services = Services::open(config).await?;
    let model = services.model()?;
    let orchestrator = Orchestrator::new(
        services.storage.clone(),
        model.clone(),
        ExecutorConfig::from(&services.config),
    );
    let mut runner = AutoDatasetRunner::new(
        services.storage.clone(),
        model.clone(),
        Arc::new(orchestrator),
    );
    if params.search_enabled {
        runner = runner.with_sources(Arc::new(services.sources(model)?));
    }

    info!(search = params.search_enabled, "building dataset");
    let cancel = cancel_on_interrupt();
    let progress = spinner()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let build = async {
        let tx = tx;
        runner.run_autodataset(&params, &cancel, &tx).await
    };
    let report = async {
        let mut failure = None;
        while let Some(event) = rx.recv().await {
            let message = describe(&event);
            match event.step {
                PipelineStep::SourceProcessCompleted | PipelineStep::SourcesIndexSuccess => {
                    progress.println(format!("  {message}"));
                }
                PipelineStep::DatasetConfigError
                | PipelineStep::SourcesIndexError
                | PipelineStep::GenericError => {
                    progress.println(format!("  {message}"));
                    if event.step.is_terminal() {
                        failure = Some(message);
                    }
                }
                _ => progress.set_message(message),
            }
        }
        failure
    };
    let (dataset, failure) = tokio::join!(build, report);
    progress.finish_and_clear();

    let Some(dataset) = dataset else {
        services.shutdown().await;
        return Err(eyre!(
            "{}",
            failure.unwrap_or_else(|| "dataset was not created".into())
        ));
    };

    println!();
    println!("  Dataset created!");
    println!("  ID:   {}", dataset.id);
    println!("  Name: {}", dataset.name);
    for column in services.storage.list_columns(dataset.id).await? {
        println!();
        println!("  {} ({})", column.name, column.id);
        if let Some(process) = &column.process {
            println!("    prompt: {}", process.instruction);
        }
        for cell in services.storage.list_cells(column.id).await? {
            match (&cell.error, cell.non_empty_value()) {
                (Some(error), _) => println!("    [{}] error: {error}", cell.row_index),
                (None, Some(value)) => println!("    [{}] {}", cell.row_index, value.trim()),
                (None, None) => println!("    [{}]", cell.row_index),
            }
        }
    }
    println!();
    services.shutdown().await;
    Ok(())
}

/// One progress line per pipeline event.
fn describe(event: &PipelineEvent) -> String {
    let data = event.data.clone().unwrap_or_default();
    let error = event.error.clone().unwrap_or_default();
    let count = |items: &Option<Vec<String>>| items.as_ref().map_or(0, Vec::len);
    match event.step {
        PipelineStep::DatasetConfig => "Designing dataset".into(),
        PipelineStep::DatasetConfigError => format!("Could not design dataset: {error}"),
        PipelineStep::DatasetCreate => {
            format!("Creating dataset '{}'", data.name.unwrap_or_default())
        }
        PipelineStep::DatasetSearch => format!("Searching the web ({} queries)", count(&data.queries)),
        PipelineStep::DatasetSearchSuccess => format!("Found {} sources", count(&data.urls)),
        PipelineStep::SourcesProcess => format!("Scraping {} sources", count(&data.urls)),
        PipelineStep::SourceProcessCompleted => {
            let status = if data.ok.unwrap_or(false) { "ok    " } else { "failed" };
            format!("{status} {}", data.url.unwrap_or_default())
        }
        PipelineStep::SourcesIndex => format!("Indexing {} sources", count(&data.urls)),
        PipelineStep::SourcesIndexSuccess => format!("Indexed {} chunks", data.count.unwrap_or(0)),
        PipelineStep::SourcesIndexError => format!("Indexing failed: {error}"),
        PipelineStep::DatasetPopulate => "Generating cells".into(),
        PipelineStep::DatasetPopulateSuccess => "Dataset ready".into(),
        PipelineStep::GenericError => format!("Failed: {error}"),
    }
}

async fn cmd_scrape(url: &str) -> Result<()> {
    Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    let config = load_config()?;
    let pool = Arc::new(BrowserPool::new());
    let scraper = Scraper::new(pool.clone(), ScrapeOptions::from(&config.scrape));

    info!(url, "scraping page");
    let page = scraper.scrape_url(url).await;
    pool.close().await;
    let page = page.ok_or_else(|| eyre!("no usable content at {url}"))?;
    println!("{}", page.content);
    Ok(())
}

async fn cmd_index(dataset: &str, urls: &[String], force: bool) -> Result<()> {
    let dataset_id = parse_dataset_id(dataset)?;
    let services = Services::open(load_config()?).await?;
    services
        .storage
        .get_dataset(dataset_id)
        .await?
        .ok_or_else(|| eyre!("dataset {dataset_id} not found"))?;
    let indexer = services.indexer()?;
    let scraper = services.scraper();

    let progress = spinner()?;
    let mut sources = Vec::with_capacity(urls.len());
    for (i, url) in urls.iter().enumerate() {
        progress.set_message(format!("Scraping [{}/{}] {url}", i + 1, urls.len()));
        match scraper.scrape_url(url).await {
            Some(page) => sources.push(IndexSource {
                url: page.url,
                title: page.title,
                snippet: page.metadata.description.clone(),
                tree: page.tree,
            }),
            None => progress.println(format!("  failed {url}")),
        }
    }

    progress.set_message(format!("Indexing {} pages", sources.len()));
    let written = if force {
        let mut written = 0;
        for source in &sources {
            written += indexer.reindex_source(dataset_id, source).await?;
        }
        written
    } else {
        indexer.index_dataset_sources(dataset_id, &sources).await?
    };
    progress.finish_and_clear();
    services.shutdown().await;

    println!("Indexed {written} chunks from {} pages.", sources.len());
    Ok(())
}

async fn cmd_query(dataset: &str, query: &str) -> Result<()> {
    let dataset_id = parse_dataset_id(dataset)?;
    let config = load_config()?;
    let storage = Arc::new(Storage::open_readonly(&config.storage.database_path()).await?);
    let embedder = Arc::new(HttpEmbedder::from_config(&config.embedding)?);
    let retriever = Retriever::new(storage, embedder);

    let passages = retriever.query_dataset_sources(dataset_id, query).await?;
    if passages.is_empty() {
        println!("No passages found.");
        return Ok(());
    }
    for (i, passage) in passages.iter().enumerate() {
        println!(
            "{}. {} (score {:.4})",
            i + 1,
            passage.source_uri,
            passage.score.unwrap_or_default()
        );
        println!("{}", passage.text.trim());
        println!();
    }
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&config.storage.database_path()).await?;
    let datasets = storage.list_datasets().await?;
    if datasets.is_empty() {
        println!("No datasets.");
        return Ok(());
    }
    for dataset in datasets {
        println!("{}  {}", dataset.id, dataset.name);
        for column in storage.list_columns(dataset.id).await? {
            let references = column
                .process
                .as_ref()
                .map_or(0, |p| p.columns_references.len());
            println!(
                "  {}  {} [{}] refs={references}",
                column.id,
                column.name,
                column.kind.as_str()
            );
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
