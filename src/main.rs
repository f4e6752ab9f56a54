use clap::Parser;
use httprox::logging;
use httprox::proxy::Daemon;
use httprox::settings::Settings;
use httprox::{PROGRAM_NAME, VERSION};
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "httprox", version, about = "A minimalistic forward HTTP/1.1 proxy")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "httprox.conf")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    logging::init(args.verbose);

    info!(
        target: "daemon",
        "{} v{}:a minimalistic forward HTTP/1.1 proxy",
        PROGRAM_NAME,
        VERSION
    );

    let settings = Settings::load(&args.config);

    let daemon = match Daemon::bind(settings.listen_address()) {
        Ok(daemon) => daemon,
        Err(e) => logging::crit(
            "daemon",
            &format!("could not bind to {} ({})", settings.listen_address(), e),
        ),
    };

    if let Err(e) = daemon.run() {
        logging::crit("daemon", &e.to_string());
    }
}
