use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use zenodo_preload::config::{ConfigLoader, ResolvedConfig};
use zenodo_preload::domain::DataFormat;
use zenodo_preload::error::PreloadError;
use zenodo_preload::output::{ClearReport, JsonOutput, ListReport, PreloadReport};
use zenodo_preload::preload::Preloader;
use zenodo_preload::progress::PreloadStatus;
use zenodo_preload::store::{CacheStore, FsCacheStore};
use zenodo_preload::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "zenodo-preload")]
#[command(about = "Preload Zenodo archives into a local dataset cache")]
#[command(version, author)]
struct Cli {
    /// Cache directory (defaults to the user cache dir).
    #[arg(long, global = true)]
    cache_dir: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, unpack and cache archives, e.g. 13333034/andorra.zip")]
    Preload(PreloadArgs),
    #[command(about = "List cached data ids")]
    List,
    #[command(about = "Remove every cached dataset")]
    Clear,
}

#[derive(Args)]
struct PreloadArgs {
    data_ids: Vec<String>,

    #[arg(long)]
    target_format: Option<DataFormat>,

    #[arg(long, value_delimiter = ',')]
    chunks: Option<Vec<usize>>,

    #[arg(long)]
    force: bool,

    /// Run download, decompression and processing on separate workers.
    #[arg(long)]
    background: bool,

    /// Log every state change.
    #[arg(long)]
    progress: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PreloadError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PreloadError) -> u8 {
    match error {
        PreloadError::InvalidIdentifier(_)
        | PreloadError::InvalidParameter(_)
        | PreloadError::UnsupportedFormat(_)
        | PreloadError::ConfigRead(_)
        | PreloadError::ConfigParse(_)
        | PreloadError::NotFound(_) => 2,
        error if error.is_transport() => 3,
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
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Arc::new(open_store(cli.cache_dir, &resolved)?);

    match cli.command {
        Commands::Preload(args) => {
            let endpoint = cli.endpoint.unwrap_or_else(|| resolved.endpoint.clone());
            run_preload(args, store, endpoint, resolved)
        }
        Commands::List => {
            let report = ListReport {
                cache_root: store.root().to_string(),
                data_ids: store.list_ids()?,
            };
            JsonOutput::print_list(&report).into_diagnostic()
        }
        Commands::Clear => {
            store.clear()?;
            JsonOutput::print_clear(&ClearReport { cleared: true }).into_diagnostic()
        }
    }
}

fn open_store(
    cache_dir: Option<Utf8PathBuf>,
    resolved: &ResolvedConfig,
) -> Result<FsCacheStore, PreloadError> {
    let root = match cache_dir {
        Some(dir) => dir,
        None => match &resolved.cache_dir {
            Some(dir) => Utf8PathBuf::from_path_buf(dir.clone()).map_err(|path| {
                PreloadError::Filesystem(format!("cache dir is not UTF-8: {}", path.display()))
            })?,
            None => FsCacheStore::default_root()?,
        },
    };
    let store = FsCacheStore::with_defaults(root);
    store.ensure_root()?;
    Ok(store)
}

fn run_preload(
    args: PreloadArgs,
    store: Arc<FsCacheStore>,
    endpoint: String,
    resolved: ResolvedConfig,
) -> miette::Result<()> {
    let data_ids = if args.data_ids.is_empty() {
        resolved.data_ids
    } else {
        args.data_ids
    };
    if data_ids.is_empty() {
        return Err(miette::Report::msg(
            "no data ids given (pass them as arguments or list them in zenodo-preload.json)",
        ));
    }

    let mut params = resolved.params;
    if args.target_format.is_some() {
        params.target_format = args.target_format;
    }
    if args.chunks.is_some() {
        params.chunks = args.chunks;
    }
    params.force |= args.force;
    params.blocking = !args.background;
    params.silent = !args.progress;

    let transport = Arc::new(HttpTransport::new()?);
    let preloader = Preloader::new(store.clone(), transport)
        .with_adapters(Arc::clone(store.adapters()))
        .with_groups(Arc::clone(store.groups()))
        .with_endpoint(endpoint);

    let handle = preloader.preload(&data_ids, params)?;
    handle.wait();

    let report = PreloadReport::from_handle(store.root().as_str(), &handle);
    JsonOutput::print_preload(&report).into_diagnostic()?;

    let failed = report
        .items
        .iter()
        .filter(|state| state.status != PreloadStatus::Preloaded)
        .count();
    if failed > 0 {
        return Err(miette::Report::msg(format!(
            "{failed} data id(s) were not preloaded"
        )));
    }
    Ok(())
}
