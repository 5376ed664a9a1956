use broker::BrokerConfig;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing::info;

fn validate_port_value(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

fn validate_existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("'{value}' is not a file"))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "broker starting");

    let matches = Command::new("relay-mq broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("In-memory pub/sub broker over a framed binary TCP protocol")
        .arg(
            Arg::new("config")
                .help("Path to the broker TOML config")
                .short('c')
                .long("config")
                .value_parser(validate_existing_file),
        )
        .arg(
            Arg::new("host")
                .help("TCP bind host (overrides the config file)")
                .long("host"),
        )
        .arg(
            Arg::new("port")
                .help("TCP bind port (overrides the config file)")
                .short('p')
                .long("port")
                .value_parser(validate_port_value),
        )
        .arg(
            Arg::new("token")
                .help("Shared auth token (overrides the config file)")
                .long("token"),
        )
        .arg(
            Arg::new("no_edge")
                .help("Disable the HTTP producer edge")
                .long("no-edge")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut conf = match matches.get_one::<PathBuf>("config") {
        Some(path) => match broker::load_config_from_path(path) {
            Ok(conf) => {
                info!(config = %path.display(), "config loaded");
                conf
            }
            Err(err) => {
                eprintln!("FATAL: failed to load config: {err}");
                std::process::exit(1);
            }
        },
        None => BrokerConfig::default(),
    };

    if let Some(host) = matches.get_one::<String>("host") {
        conf.host.clone_from(host);
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        conf.port = *port;
    }
    if let Some(token) = matches.get_one::<String>("token") {
        conf.token.clone_from(token);
    }
    if matches.get_flag("no_edge") {
        conf.edge.enabled = false;
    }

    if let Err(err) = broker::run(conf).await {
        eprintln!("FATAL: broker failed: {err}");
        std::process::exit(1);
    }
}
