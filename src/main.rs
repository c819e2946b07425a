use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf};

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use plausible_mcp::{
    DEFAULT_API_URL, PlausibleClient, PlausibleError,
    cache::DEFAULT_CAPACITY,
    server::{self, ServeConfig},
    tools::{PlausibleServer, serve_stdio},
};
use tracing::error;
use tracing_subscriber::EnvFilter;

const DEFAULT_CREDENTIAL_PATHS: &str =
    "./firebase-service-account.json,/etc/secrets/firebase-service-account.json";

#[derive(Debug, Parser)]
#[command(author, version, about = "Plausible Analytics MCP server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a single MCP client over stdin/stdout.
    Stdio(StdioArgs),
    /// Start the HTTP server exposing MCP on /mcp plus usage analytics.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
struct StdioArgs {
    /// Base URL of the Plausible instance.
    #[arg(long, env = "PLAUSIBLE_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Plausible API key.
    #[arg(long, env = "PLAUSIBLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Default Plausible base URL for requests that do not name one.
    #[arg(long, env = "PLAUSIBLE_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Default API key for requests that carry none.
    #[arg(long, env = "PLAUSIBLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Address to bind the HTTP server to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the HTTP server to.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Directory holding the local analytics snapshot.
    #[arg(long, env = "ANALYTICS_DIR", default_value = "./analytics")]
    analytics_dir: PathBuf,

    /// Comma separated search path for the Firebase service account file.
    #[arg(
        long,
        env = "FIREBASE_CREDENTIALS_PATH",
        value_delimiter = ',',
        default_value = DEFAULT_CREDENTIAL_PATHS
    )]
    firebase_credentials: Vec<PathBuf>,

    /// Maximum number of per-credential protocol servers kept alive.
    #[arg(long, env = "MCP_CACHE_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    cache_capacity: NonZeroUsize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Stdio(args) => {
            if let Err(err) = run_stdio(args).await {
                error!(error = %err, "stdio server failed");
                std::process::exit(1);
            }
        }
        Command::Serve(args) => {
            run_server(args).await?;
        }
    }

    Ok(())
}

/// Logs always go to stderr; stdout belongs to the stdio transport.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

async fn run_stdio(args: StdioArgs) -> Result<(), Box<dyn std::error::Error>> {
    let Some(api_key) = args.api_key.filter(|key| !key.trim().is_empty()) else {
        return Err("PLAUSIBLE_API_KEY is required for stdio mode".into());
    };

    let client = PlausibleClient::new(&args.api_url, &api_key).map_err(report_client_error)?;
    serve_stdio(PlausibleServer::new(client, None)).await
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = ServeConfig {
        addr,
        api_url: args.api_url,
        api_key: args.api_key,
        analytics_dir: args.analytics_dir,
        credential_paths: args.firebase_credentials,
        cache_capacity: args.cache_capacity,
    };

    server::serve(config).await
}

fn report_client_error(err: PlausibleError) -> Box<dyn std::error::Error> {
    if let PlausibleError::InvalidEndpoint { endpoint, .. }
    | PlausibleError::UnsupportedScheme { endpoint } = &err
    {
        error!(%endpoint, "check PLAUSIBLE_API_URL");
    }
    Box::new(err)
}
