//! # Confsync CLI Entry Point
//!
//! Main binary for the confsync configuration client and the notification
//! hub server.
//!
//! ## Usage
//!
//! ```bash
//! # Run the notification hub
//! confsync serve -b 0.0.0.0:8080
//!
//! # Read one property (outputs the raw value for unix tool usage)
//! confsync get --meta http://127.0.0.1:8080 --app demo request.timeout
//!
//! # Follow change events, one JSON line per event
//! confsync watch --meta http://127.0.0.1:8080 --app demo
//! ```
//!
//! ## URL Format
//!
//! Meta server URLs must include the `http://` or `https://` prefix.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use confsync_client::{
    ClientSettings, ConfigChangeEvent, ConfigChangeListener, ConfigClient, FnListener,
};
use confsync_server::{NotificationHub, NotificationServer};

/// Validates that a URL string starts with http:// or https://
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// confsync - distributed configuration client and notification hub
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Get(GetArgs),
    Watch(WatchArgs),
}

/// Arguments for running the notification hub server.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the notification hub server
struct ServeArgs {
    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// seconds an unanswered long poll is held before the 304 default
    #[argh(option, long = "hold-timeout", default = "60")]
    hold_timeout_secs: u64,
}

/// Arguments shared by the client subcommands.
#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
/// read one property and print its value
struct GetArgs {
    /// meta server URL used for service discovery
    #[argh(option, long = "meta")]
    meta: String,

    /// application id
    #[argh(option, long = "app")]
    app: String,

    /// cluster name
    #[argh(option, long = "cluster", default = "\"default\".into()")]
    cluster: String,

    /// namespace to read from
    #[argh(option, short = 'n', long = "namespace", default = "\"application\".into()")]
    namespace: String,

    /// property key to read
    #[argh(positional)]
    key: String,

    /// value printed when the key is absent
    #[argh(option, short = 'd', long = "default", default = "String::new()")]
    default: String,
}

/// Arguments for following change events.
#[derive(FromArgs)]
#[argh(subcommand, name = "watch")]
/// follow change events and print one JSON line per event
struct WatchArgs {
    /// meta server URL used for service discovery
    #[argh(option, long = "meta")]
    meta: String,

    /// application id
    #[argh(option, long = "app")]
    app: String,

    /// cluster name
    #[argh(option, long = "cluster", default = "\"default\".into()")]
    cluster: String,

    /// namespace to watch
    #[argh(option, short = 'n', long = "namespace", default = "\"application\".into()")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // keep `get` output clean for unix tool usage (piping to jq, etc.)
    if !matches!(cli.command, Commands::Get(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Get(args) => run_get(args).await,
        Commands::Watch(args) => run_watch(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let hub = NotificationHub::with_hold_timeout(Duration::from_secs(args.hold_timeout_secs));
    let server = NotificationServer::new(hub);

    tracing::info!("starting notification hub on {addr}");
    server.run(addr).await?;
    Ok(())
}

async fn run_get(args: GetArgs) -> Result<()> {
    validate_http_url(&args.meta, "meta server URL")?;

    let settings = ClientSettings::new(&args.app, &args.meta).with_cluster(&args.cluster);
    let client = ConfigClient::new(settings).await?;
    let config = client.config(&args.namespace).await?;

    println!("{}", config.get_property(&args.key, &args.default));

    client.shutdown().await;
    Ok(())
}

async fn run_watch(args: WatchArgs) -> Result<()> {
    validate_http_url(&args.meta, "meta server URL")?;

    let settings = ClientSettings::new(&args.app, &args.meta)
        .with_cluster(&args.cluster)
        .with_long_poll_initial_delay(Duration::from_millis(200));
    let client = ConfigClient::new(settings).await?;
    let config = client.config(&args.namespace).await?;
    tracing::info!(namespace = %args.namespace, "watching for changes, ctrl-c to stop");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ConfigChangeEvent>();
    let listener: Arc<dyn ConfigChangeListener> =
        Arc::new(FnListener(move |event: &ConfigChangeEvent| {
            let _ = tx.send(event.clone());
        }));
    config.add_change_listener(listener);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
