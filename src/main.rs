use clap::Parser;
use lsp_session_manager::logging::{LogConfig, init_logging};
use lsp_session_manager::server::{
    OutputSinks, StaticConfiguration, StaticExecutableResolver, TransportMode,
};
use lsp_session_manager::workspace::{
    RequestDispatcher, RequestOutcome, SessionEvent, SessionRegistry, WorkspaceFolder,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

/// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root; repeat for several roots (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    root: Vec<PathBuf>,

    /// Interpreter running the server (overrides LSM_INTERPRETER)
    #[arg(long, value_name = "PATH")]
    interpreter: Option<String>,

    /// Server entry point script (overrides LSM_SERVER_ENTRY)
    #[arg(long, value_name = "PATH")]
    server_entry: Option<PathBuf>,

    /// Transport mode for every root without its own settings
    #[arg(long, value_enum)]
    mode: Option<TransportMode>,

    /// Port of an already-running server in socket mode (0 = default port)
    #[arg(long)]
    port: Option<u16>,

    /// Launch the server on an ephemeral port in socket mode
    #[arg(long)]
    launch_server: bool,

    /// JSON settings file: {"default": {...}, "workspaces": {"<uri>": {...}}}
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Launch servers with their debug logging flag
    #[arg(long)]
    debug_server: bool,

    /// Log level (overrides RUST_LOG)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides LSM_LOG_FILE)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Resource (URI or path) to send a request for; without it every root's
    /// session is started and listed
    #[arg(long, value_name = "URI")]
    resource: Option<String>,

    /// Request to send for --resource
    #[arg(long, default_value = "discovering/getTestsFromDocument")]
    method: String,

    /// JSON params; defaults to {"documentUri": <resource>}
    #[arg(long, value_name = "JSON")]
    params: Option<String>,
}

fn workspace_folders(roots: &[PathBuf]) -> Result<Vec<WorkspaceFolder>, Box<dyn std::error::Error>> {
    let roots = if roots.is_empty() {
        vec![std::env::current_dir()?]
    } else {
        roots.to_vec()
    };

    roots
        .iter()
        .map(|root| {
            let root = if root.is_absolute() {
                root.clone()
            } else {
                std::env::current_dir()?.join(root)
            };
            Ok(WorkspaceFolder::from_path(&root)?)
        })
        .collect()
}

fn load_configuration(args: &Args) -> Result<StaticConfiguration, Box<dyn std::error::Error>> {
    let mut configuration = match &args.settings {
        Some(path) => StaticConfiguration::load(path)?,
        None => StaticConfiguration::default(),
    };

    let defaults = configuration.default_settings_mut();
    if let Some(mode) = args.mode {
        defaults.mode = mode;
    }
    if let Some(port) = args.port {
        defaults.tcp_port = port;
    }
    if args.launch_server {
        defaults.launch_server = true;
    }
    Ok(configuration)
}

fn parse_resource(resource: &str) -> Result<Url, Box<dyn std::error::Error>> {
    if let Ok(url) = Url::parse(resource) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }
    let path = Path::new(resource);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&path).map_err(|()| format!("invalid resource path: {}", path.display()).into())
}

async fn run(
    args: &Args,
    dispatcher: &RequestDispatcher,
    token: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(resource) = &args.resource else {
        for folder in dispatcher.registry().folders() {
            match dispatcher
                .registry()
                .get_or_create(&folder.key(), &folder.uri)
                .await
            {
                Ok(Some(_)) => info!("Session for {} is running", folder.name),
                Ok(None) => warn!("Server for {} did not become ready", folder.name),
                Err(e) => error!("Could not start session for {}: {}", folder.name, e),
            }
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&dispatcher.registry().sessions())?
        );
        return Ok(());
    };

    let resource = parse_resource(resource)?;
    let params: Value = match &args.params {
        Some(json) => serde_json::from_str(json)?,
        None => serde_json::json!({ "documentUri": resource.as_str() }),
    };

    let outcome: RequestOutcome<Value> = dispatcher
        .send_with_cancellation(&resource, &args.method, Some(params), token)
        .await?;

    match outcome {
        RequestOutcome::Completed(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        RequestOutcome::Cancelled => warn!("Request {} was cancelled", args.method),
        RequestOutcome::NoSession => warn!("No workspace session for {}", resource),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let folders = workspace_folders(&args.root)?;
    let configuration = load_configuration(&args)?;
    let resolver =
        StaticExecutableResolver::from_env(args.interpreter.clone(), args.server_entry.clone());

    info!(
        "Managing {} workspace root(s): {:?}",
        folders.len(),
        folders.iter().map(|f| f.name.as_str()).collect::<Vec<_>>()
    );

    let registry = SessionRegistry::builder()
        .with_folders(folders)
        .with_resolver(Arc::new(resolver))
        .with_configuration(Arc::new(configuration))
        .with_sinks(OutputSinks::tracing())
        .with_debug_server(args.debug_server)
        .build();

    let mut events = registry.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { key, state, .. } => info!("{} is {}", key, state),
                SessionEvent::Closed {
                    key,
                    restart_eligible,
                } => warn!(
                    "{} closed unexpectedly (restart eligible: {})",
                    key, restart_eligible
                ),
            }
        }
    });

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            ctrl_c_token.cancel();
        }
    });

    let dispatcher = RequestDispatcher::new(registry.clone());
    let result = run(&args, &dispatcher, &token).await;

    let summary = registry.shutdown().await;
    info!(
        "Shutdown complete: {} stopped, {} failed",
        summary.stopped, summary.failed
    );
    event_logger.abort();

    result
}
