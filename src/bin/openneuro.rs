use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use openneuro::api::OpenNeuroHttpClient;
use openneuro::app::{
    App, DownloadOptions, DownloadRequest, DownloadResult, FileAction, LoginResult,
};
use openneuro::config::{CredentialStore, LOGIN_HINT};
use openneuro::domain::{DatasetId, SnapshotTag};
use openneuro::error::OpenNeuroError;
use openneuro::output::{JsonOutput, OutputMode};
use openneuro::prompt::{StdinCredential, TerminalPrompt};
use openneuro::transfer::HttpTransfer;
use openneuro::tui::{Tui, bytes_to_human};

#[derive(Parser)]
#[command(name = "openneuro")]
#[command(about = "Download neuroimaging datasets from OpenNeuro")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Store an OpenNeuro API key in ~/.openneuro")]
    Login(LoginArgs),
    #[command(about = "Download a dataset snapshot, resuming any previous download")]
    Download(DownloadArgs),
}

#[derive(Args)]
struct LoginArgs {
    /// Credential file to write instead of ~/.openneuro
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct DownloadArgs {
    /// Dataset accession number, e.g. ds000246
    #[arg(long)]
    dataset: String,

    /// Snapshot tag; defaults to the latest snapshot or the one already downloaded
    #[arg(long)]
    tag: Option<String>,

    /// Directory to download into; defaults to ./<dataset>
    #[arg(long)]
    target_dir: Option<String>,

    /// Only download files matching this pattern (repeatable)
    #[arg(long)]
    include: Vec<String>,

    /// Skip files matching this pattern (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Credential file to read instead of ~/.openneuro
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    no_verify_size: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<OpenNeuroError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &OpenNeuroError) -> u8 {
    match error {
        OpenNeuroError::MissingCredentials(_)
        | OpenNeuroError::MissingApiKey(_)
        | OpenNeuroError::DatasetNotFound(_)
        | OpenNeuroError::SnapshotNotFound { .. }
        | OpenNeuroError::DatasetMismatch { .. }
        | OpenNeuroError::RevisionExists { .. }
        | OpenNeuroError::MissingDatasetDoi(_) => 2,
        OpenNeuroError::ApiHttp(_)
        | OpenNeuroError::ApiStatus { .. }
        | OpenNeuroError::Graphql(_)
        | OpenNeuroError::TransferHttp(_)
        | OpenNeuroError::TransferStatus { .. } => 3,
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
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Login(args) => run_login(args, output_mode),
        Commands::Download(args) => run_download(args, output_mode),
    }
}

fn credential_store(path: Option<PathBuf>) -> Result<CredentialStore, OpenNeuroError> {
    match path {
        Some(path) => Ok(CredentialStore::with_path(path)),
        None => CredentialStore::new(),
    }
}

fn run_login(args: LoginArgs, output_mode: OutputMode) -> miette::Result<()> {
    let store = credential_store(args.config)?;
    match output_mode {
        OutputMode::NonInteractive => {
            let credentials = store.init(&StdinCredential)?;
            JsonOutput::print_login(&LoginResult {
                config_path: store.path().display().to_string(),
                url: credentials.url,
            })
            .into_diagnostic()?;
        }
        OutputMode::Interactive => {
            eprintln!("{LOGIN_HINT}");
            store.init(&TerminalPrompt)?;
            eprintln!("✅ API key saved to {}", store.path().display());
        }
    }
    Ok(())
}

fn run_download(args: DownloadArgs, output_mode: OutputMode) -> miette::Result<()> {
    let DownloadArgs {
        dataset,
        tag,
        target_dir,
        include,
        exclude,
        config,
        dry_run,
        no_verify_size,
    } = args;

    let dataset = dataset.parse::<DatasetId>()?;
    let tag = tag
        .map(|value| value.parse::<SnapshotTag>())
        .transpose()?;
    let target_dir = match target_dir {
        Some(dir) => Utf8PathBuf::from(dir),
        None => Utf8PathBuf::from(dataset.as_str()),
    };

    let store = credential_store(config)?;
    let token = match store.token_if_configured() {
        Ok(token) => token,
        Err(OpenNeuroError::MissingApiKey(path)) => {
            warn!(path = %path.display(), "config file has no apikey, downloading anonymously");
            None
        }
        Err(err) => return Err(err.into()),
    };
    let base_url = if store.exists() {
        Some(store.load()?.url)
    } else {
        None
    };

    let api = OpenNeuroHttpClient::new(base_url.as_deref(), token.as_deref())?;
    let transfer = HttpTransfer::new(token.as_deref())?;
    let app = App::new(api, transfer);

    let request = DownloadRequest {
        dataset,
        tag,
        target_dir,
        include,
        exclude,
    };
    let options = DownloadOptions {
        dry_run,
        verify_size: !no_verify_size,
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.download(request, options, &JsonOutput)?;
            JsonOutput::print_download(&result).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(request.dataset.to_string(), request.target_dir.to_string());
            let result = tui.run(move |sink| app.download(request, options, sink))?;
            print_download_summary(&result);
        }
    }
    Ok(())
}

fn print_download_summary(result: &DownloadResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}📦 {} {} → {}{reset}",
        result.dataset, result.tag, result.target_dir
    );
    println!(
        "{green}✅ Downloaded: {}  Resumed: {}  ({}){reset}",
        result.count(FileAction::Downloaded),
        result.count(FileAction::Resumed),
        bytes_to_human(result.bytes_transferred)
    );
    println!(
        "{yellow}♻️ Already complete: {}{reset}",
        result.count(FileAction::Skipped)
    );
    let planned = result.count(FileAction::Planned);
    if planned > 0 {
        println!("{yellow}📝 Would download (dry run): {planned}{reset}");
        for file in result
            .files
            .iter()
            .filter(|file| file.action == FileAction::Planned)
        {
            println!("{yellow}   {}{reset}", file.path);
        }
    }
}
