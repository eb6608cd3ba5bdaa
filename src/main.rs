use std::error::Error;

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use meshbgpd::cli::{query_bgpd, Args, Command};
use meshbgpd::{from_file, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let (bgpd_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("meshbgpd"), bgpd_level)
        .filter(None, other_level)
        .init();

    let options = match &args.cmd {
        Command::Run(options) => options,
        _ => {
            query_bgpd(&args).await;
            return Ok(());
        }
    };
    info!("Logging at levels {}/{}", bgpd_level, other_level);

    let config = from_file(&options.config_path)?;
    debug!("Found {} peers in {}", config.peers.len(), options.config_path);
    let api_socket = args.api.unwrap_or(config.api);

    let server = Server::new(config);
    server.start().await?;
    let (_, api) = server.serve_rpc_api(api_socket).await?;

    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    let signal = tokio::task::spawn_blocking(move || signals.forever().next()).await?;
    info!("Received signal {:?}, stopping...", signal);

    server.shutdown().await;
    // Let sessions flush their NOTIFICATIONs
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    api.stop()?;
    Ok(())
}
