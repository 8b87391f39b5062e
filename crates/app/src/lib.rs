use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use toolbench_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use toolbench_core::decode::{Artifact, DecodeOptions};
use toolbench_core::dispatch::ComputeBackend;
use toolbench_core::job::{Job, JobMode};
use toolbench_core::livekit::TokenRequest;
use toolbench_core::logging::{self, FileSink, LogFilters, LogOptions, DEFAULT_LOG_FILTER};
use toolbench_core::proxy_client::ProxyClient;
use toolbench_core::server::{app_router, AppState};
use toolbench_core::session::{InputFile, JobSession, RunRequest, StatusMessage};
use toolbench_core::settings::{JsonFileStore, SessionSettings, Settings};
use toolbench_core::tool::{catalog, ToolKind};
use toolbench_core::upload::UploadBackend;
use toolbench_core::upstream::{ResourceClient, RunpodClient};

#[derive(Parser)]
#[command(
    name = "toolbench",
    about = "Proxy and job client for GPU image tools",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload inputs, run a tool and wait for its output.
    Run(RunArgs),
    /// Poll an existing job until it finishes.
    Status(StatusArgs),
    /// Print the tool catalog.
    Tools,
    /// Request a real-time agent token using the saved session settings.
    AgentToken(AgentTokenArgs),
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, value_name = "URL", help = "Proxy base URL (defaults to client.proxy_url)")]
    proxy: Option<String>,
    #[arg(
        long,
        help = "Talk to the compute and resource services directly using the server credentials"
    )]
    direct: bool,
    #[arg(long, value_name = "MS", help = "Status poll interval in milliseconds")]
    poll_interval_ms: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Sync,
    Async,
}

impl From<ModeArg> for JobMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Sync => JobMode::Sync,
            ModeArg::Async => JobMode::Async,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[arg(help = "Tool slug, e.g. magic-paint or clothes-swapper")]
    tool: String,
    #[arg(required = true, help = "Input image(s); the clothes swapper takes person then garment")]
    inputs: Vec<PathBuf>,
    #[arg(long, value_enum, help = "Override the tool's default mode")]
    mode: Option<ModeArg>,
    #[arg(
        long = "param",
        value_name = "KEY=VALUE",
        help = "Extra input fields (repeatable; JSON values are parsed, e.g. --param seed=7)"
    )]
    params: Vec<String>,
    #[arg(long, help = "PBR map to return (albedo, normals, roughness, metalness, depth or all)")]
    map_type: Option<String>,
    #[arg(short = 'o', long, help = "Write decoded image output to this path")]
    output: Option<PathBuf>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args)]
struct StatusArgs {
    tool: String,
    job_id: String,
    #[arg(long)]
    map_type: Option<String>,
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args)]
struct AgentTokenArgs {
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,
    #[arg(long)]
    room: Option<String>,
    #[arg(long)]
    name: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, Some(resolved_data_dir.as_path()));

    match cli.command {
        Some(Commands::Run(args)) => run_tool(args, &resolved_data_dir).await,
        Some(Commands::Status(args)) => poll_job(args, &resolved_data_dir).await,
        Some(Commands::Tools) => print_tools(),
        Some(Commands::AgentToken(args)) => agent_token(args, &resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeLogMode {
    Cli,
    Server,
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let options = LogOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log: std::env::var("RUST_LOG").ok(),
    };
    let filters = LogFilters::resolve(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    match logging::open_file_sink(options.data_dir.as_deref()) {
        FileSink::Ready { log_dir, appender } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::masking_writer(appender))
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            debug!(mode = runtime_mode_name(mode), log_dir = %log_dir.display(), "File logging enabled");
        }
        FileSink::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode = runtime_mode_name(mode),
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode = runtime_mode_name(mode), pid, "Runtime startup metadata");
    }
}

/// File config with the environment overlay applied.
fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env();
    config
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override.unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());
    let examples_dir = config.examples_dir(&data_dir);
    if !examples_dir.is_dir() {
        info!(dir = %examples_dir.display(), "Example image directory not found; /api/list-examples will fail");
    }

    let state = AppState::new(config, examples_dir).context("failed to build upstream clients")?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting toolbench server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn parse_tool(slug: &str) -> Result<ToolKind> {
    ToolKind::from_slug(slug).with_context(|| {
        let known: Vec<&str> = ToolKind::ALL.iter().map(|tool| tool.slug()).collect();
        format!("unknown tool '{slug}' (expected one of: {})", known.join(", "))
    })
}

/// Parse repeated `KEY=VALUE` flags. Values that parse as JSON keep their
/// type; anything else is a string.
fn parse_params(args: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for arg in args {
        let Some((key, raw)) = arg.split_once('=') else {
            bail!("invalid --param '{arg}': expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --param '{arg}': empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

fn build_session(client: &ClientArgs, config: &AppConfig, tool: ToolKind) -> Result<JobSession> {
    let (compute, uploads): (Arc<dyn ComputeBackend>, Arc<dyn UploadBackend>) = if client.direct {
        (
            Arc::new(RunpodClient::new(config.upstream.clone())?),
            Arc::new(ResourceClient::new(&config.upstream)?),
        )
    } else {
        let base = client.proxy.as_deref().unwrap_or(&config.client.proxy_url);
        let proxy = ProxyClient::new(base, config.upstream.request_timeout())?.with_upload_tool(tool);
        let proxy = Arc::new(proxy);
        (proxy.clone(), proxy)
    };

    let interval = client
        .poll_interval_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or_else(|| config.client.poll_interval());

    let session = JobSession::new(compute, uploads, interval)?
        .on_update(Box::new(|job: &Job, status: &StatusMessage| {
            eprintln!("[{:>3}%] {status}", job.progress);
        }));
    Ok(session)
}

async fn run_tool(args: RunArgs, data_dir: &Path) -> Result<()> {
    let tool = parse_tool(&args.tool)?;
    let config = load_config(data_dir);

    let mut inputs = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        inputs.push(InputFile::from_path(path).await?);
    }

    let mut request = RunRequest::new(tool, inputs);
    request.mode = args.mode.map(JobMode::from);
    request.params = parse_params(&args.params)?;
    request.options = DecodeOptions {
        map_type: args.map_type,
    };

    let mut session = build_session(&args.client, &config, tool)?;
    let job = session.run(request).await?;
    report_job(&job, args.output.as_deref())
}

async fn poll_job(args: StatusArgs, data_dir: &Path) -> Result<()> {
    let tool = parse_tool(&args.tool)?;
    let config = load_config(data_dir);
    let options = DecodeOptions {
        map_type: args.map_type,
    };

    let mut session = build_session(&args.client, &config, tool)?;
    let job = session.watch(tool, &args.job_id, options).await?;
    report_job(&job, args.output.as_deref())
}

fn report_job(job: &Job, output: Option<&Path>) -> Result<()> {
    let Some(artifact) = job.result.as_ref() else {
        bail!("job finished without an output");
    };
    if let Some(id) = &job.id {
        println!("job: {id}");
    }
    match artifact {
        Artifact::Url { url } => println!("output: {url}"),
        other => println!("output: {}", other.summary()),
    }
    if let Some(path) = output {
        for written in save_artifact(artifact, path)? {
            println!("saved: {}", written.display());
        }
    }
    Ok(())
}

/// Write decoded images next to `path`: the main image at `path`, extra
/// images (mask, PBR maps) as `<stem>_<name>.<ext>`.
fn save_artifact(artifact: &Artifact, path: &Path) -> Result<Vec<PathBuf>> {
    let images = artifact.images()?;
    if images.is_empty() {
        bail!("output is a URL; nothing to save locally");
    }

    let mut written = Vec::with_capacity(images.len());
    for (name, bytes) in images {
        let target = suffixed_path(path, &name);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        written.push(target);
    }
    Ok(written)
}

fn suffixed_path(path: &Path, name: &str) -> PathBuf {
    if name.is_empty() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}_{name}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{name}"),
    };
    path.with_file_name(file_name)
}

fn print_tools() -> Result<()> {
    for entry in catalog() {
        let route = entry.api_path.as_deref().unwrap_or("-");
        println!("{:<20} {:<24} {}", entry.id, route, entry.title);
        println!("{:<20} {}", "", entry.description);
    }
    Ok(())
}

async fn agent_token(args: AgentTokenArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let ws_url = config.livekit.ws_url.clone().unwrap_or_default();
    let store = JsonFileStore::new(config.settings_path(data_dir));
    let mut settings = Settings::load(store, SessionSettings::with_ws_url(ws_url));

    if args.room.is_some() || args.name.is_some() {
        settings.update(|s| {
            if let Some(room) = args.room {
                s.room_name = room;
            }
            if let Some(name) = args.name {
                s.participant_name = name;
            }
        })?;
    }

    let base = args.proxy.as_deref().unwrap_or(&config.client.proxy_url);
    let proxy = ProxyClient::new(base, config.upstream.request_timeout())?;
    let response = proxy
        .livekit_token(&TokenRequest::from_settings(settings.get()))
        .await?;

    settings.update(|s| {
        s.token = response.access_token.clone();
        s.participant_id = response.identity.clone();
    })?;

    println!("identity: {}", response.identity);
    if !settings.get().ws_url.is_empty() {
        println!("url: {}", settings.get().ws_url);
    }
    println!("token: {}", response.access_token);
    Ok(())
}
