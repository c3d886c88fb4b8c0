use anyhow::bail;
use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use magfetch::config;
use magfetch::config::Config;
use magfetch::dht::DhtServer;
use magfetch::dht::DhtState;
use magfetch::fetch::FetchError;
use magfetch::fetch::Fetcher;
use magfetch::server;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Turn a magnet link into a torrent file.
#[derive(Debug, Parser)]
#[command(name = "magfetch", version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Participate in the mainline DHT as a peer source
    #[arg(long, global = true)]
    use_dht: bool,

    /// Where to load and save DHT routing state
    #[arg(long, global = true)]
    dht_state_file: Option<PathBuf>,

    /// Port to listen for DHT traffic on
    #[arg(long, global = true, default_value_t = config::DHT_PORT)]
    dht_port: u16,

    /// Host to listen for DHT traffic on
    #[arg(long, global = true, default_value = "0.0.0.0")]
    dht_ip: Ipv4Addr,

    /// Folder to cache fetched metadata into
    #[arg(long, global = true)]
    torrent_cache_folder: Option<PathBuf>,

    /// Announce to a built-in list of open trackers as well
    #[arg(long, global = true)]
    use_additional_trackers: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a torrent and save it into the working directory
    Fetch {
        /// Magnet link
        magnet: String,
    },
    /// Run an HTTP server that serves torrents via an API or directly
    Serve {
        /// Host to listen on
        #[arg(long, default_value = "0.0.0.0")]
        ip: IpAddr,

        /// Port to listen on
        #[arg(long, default_value_t = 18667)]
        port: u16,

        /// Protect the endpoint with an apikey=<key> url parameter
        #[arg(long)]
        apikey: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(folder) = &cli.torrent_cache_folder {
        if !folder.exists() {
            std::fs::create_dir_all(folder)
                .with_context(|| format!("creating {}", folder.display()))?;
        }
        if !folder.is_dir() {
            bail!("path {} exists but is not a folder", folder.display());
        }
    }

    let dht = if cli.use_dht {
        Some(start_dht(&cli).await?)
    } else {
        None
    };

    let config = Config {
        use_additional_trackers: cli.use_additional_trackers,
        dht: dht.clone(),
        torrent_cache_folder: cli.torrent_cache_folder.clone(),
        ..Config::default()
    };

    match cli.command {
        Command::Fetch { magnet } => {
            let fetcher = Fetcher::new(config);
            match fetcher.retrieve(&magnet).await {
                Ok((filename, torrent)) => {
                    tokio::fs::write(&filename, &torrent)
                        .await
                        .with_context(|| format!("writing {filename}"))?;
                    println!("Downloaded magnet link into file: {filename}");
                }
                Err(FetchError::FailedToFetch) => bail!("Unable to fetch magnet link"),
                Err(err) => return Err(err.into()),
            }
            if let (Some(dht), Some(state_file)) = (&dht, &cli.dht_state_file) {
                dht.save_state(state_file).await?;
            }
            Ok(())
        }
        Command::Serve { ip, port, apikey } => {
            server::serve(SocketAddr::new(ip, port), config, apikey).await
        }
    }
}

/// Brings the DHT node up: from the saved state file when one exists,
/// otherwise by bootstrapping from the well-known nodes.
async fn start_dht(cli: &Cli) -> anyhow::Result<DhtServer> {
    println!("Bootstrapping DHT server");
    let saved_state = match &cli.dht_state_file {
        Some(path) if path.is_file() => Some(DhtState::load(path).await?),
        _ => None,
    };
    let fresh = saved_state.is_none();
    let server = DhtServer::listen(
        cli.dht_ip,
        cli.dht_port,
        saved_state.unwrap_or_default(),
    )
    .await
    .context("binding DHT socket")?;
    if fresh {
        server.bootstrap(config::DHT_BOOTSTRAP_NODES).await;
    }
    if let Some(state_file) = &cli.dht_state_file {
        server.save_state_regularly(state_file.clone());
    }
    println!("Done bootstrapping DHT server");
    Ok(server)
}
