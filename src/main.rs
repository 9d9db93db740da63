mod config;
mod daemon;
mod delivery;
mod message;
mod privileges;
mod ratelimiter;
mod route;
mod server;
mod session;
mod tls;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use config::Loaded;
use server::Server;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "kutsche",
    about = "A receive-only SMTP daemon that delivers mail to local directories or Matrix rooms"
)]
pub struct Opt {
    /// Path to the configuration file
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/kutsche.toml",
        parse(from_os_str)
    )]
    pub config: PathBuf,

    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Loaded {
        settings,
        routes,
        certs,
    } = config::load(&opt.config)
        .with_context(|| format!("could not load configuration from {:?}", opt.config))?;

    // Fork before the runtime exists; the child gets its own one.
    if opt.daemon {
        daemon::daemonize(&settings.pid_file)?;
    }

    tokio::runtime::Runtime::new()
        .context("could not create async runtime")?
        .block_on(run(settings, routes, certs))
}

async fn run(
    settings: config::Settings,
    routes: route::RouteTable,
    certs: tls::CertStore,
) -> Result<()> {
    let unix_user = settings.unix_user.clone();
    let unix_group = settings.unix_group.clone();

    let server = Arc::new(Server::new(settings, routes, certs));
    let listeners = server.bind().await?;

    // All privileged binds are done; never serve privileged. A failed
    // drop takes the process down.
    privileges::drop_privileges(unix_user.as_deref(), unix_group.as_deref())?;

    tracing::info!("accepting connections");
    server.run(listeners).await
}
