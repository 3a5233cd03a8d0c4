//! dreiattest - operator CLI
//!
//! Signs or sends requests against a server using a software attestor, and
//! manages the install identity kept in the store file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reqwest::Method;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dreiattest::{
    signer::hash_request, AttestConfig, AttestService, FileStore, KeyValueStore, MemoryStore,
    SoftwareAttestor,
};

#[derive(Parser)]
#[command(name = "dreiattest")]
#[command(about = "Attested request signing client")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "DREIATTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Server base URL (overrides config file)
    #[arg(long, env = "DREIATTEST_BASE_URL")]
    base_url: Option<String>,

    /// Logical user id (overrides config file)
    #[arg(long, env = "DREIATTEST_UID")]
    uid: Option<String>,

    /// Store file for identities and key handles (overrides config file)
    #[arg(long, env = "DREIATTEST_STORE")]
    store: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the service identity and cached key
    Identity,

    /// Print the headers a request would be sent with
    Sign {
        url: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Send an attested request and print the response
    Send {
        url: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Revoke the current key on the server
    Deregister,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dreiattest={},info", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;

    let store: Arc<dyn KeyValueStore> = match &config.store_path {
        Some(path) => Arc::new(FileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    let bypass = config.shared_secret.is_some();
    let service = AttestService::new(config, Arc::new(SoftwareAttestor::new()), store)?;
    if !bypass && matches!(cli.command, Command::Sign { .. } | Command::Send { .. }) {
        // software keys live only as long as this process
        service.invalidate_key();
    }

    match cli.command {
        Command::Identity => {
            println!("service uid: {}", service.service_uid());
            match service.key_id() {
                Some(key_id) => println!("key id:      {}", key_id),
                None => println!("key id:      (none)"),
            }
        }
        Command::Sign { url, method, data } => {
            let request = build_request(&service, &url, &method, data)?;
            println!("request hash: {}", hex::encode(hash_request(&request)?));

            let request = service.adapt(request).await?;
            println!("{} {}", request.method(), request.url());
            for (name, value) in request.headers() {
                println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        }
        Command::Send { url, method, data } => {
            let request = build_request(&service, &url, &method, data)?;
            let response = service.execute(request).await?;
            let status = response.status();
            let body = response.text().await?;
            println!("{}", status);
            println!("{}", body);
        }
        Command::Deregister => {
            service.deregister_key().await;
            info!(service_uid = %service.service_uid(), "Deregistration requested");
        }
    }

    service.shutdown();
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AttestConfig> {
    let mut config = match (&cli.config, &cli.base_url) {
        (Some(path), _) => AttestConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(base_url)) => AttestConfig::new(base_url.clone()),
        (None, None) => bail!("either --config or --base-url is required"),
    };

    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(uid) = &cli.uid {
        config.uid = uid.clone();
    }
    if let Some(store) = &cli.store {
        config.store_path = Some(store.clone());
    }
    config.apply_env();
    config.validate()?;

    Ok(config)
}

fn build_request(
    service: &AttestService,
    url: &str,
    method: &str,
    data: Option<String>,
) -> anyhow::Result<reqwest::Request> {
    let method: Method = method
        .to_uppercase()
        .parse()
        .with_context(|| format!("invalid method {}", method))?;

    let mut builder = service.client().request(method, url);
    if let Some(data) = data {
        builder = builder.body(data);
    }
    Ok(builder.build()?)
}
