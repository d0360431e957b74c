// CLI entry point for the Boardroom session server.
//
// Loads the optional TOML config, layers CLI flags on top, installs logging,
// then starts the session listener and (when an admin password is set) the
// admin channel. Runs until the admin channel stops, or forever without one.
//
// Usage:
//   boardroom-server [OPTIONS]
//     --config <FILE>          TOML config file
//     --bind <ADDR>            Session bind address (default: 127.0.0.1)
//     --port <PORT>            Session port (default: 7878)
//     --admin-port <PORT>      Admin port (default: 7879)
//     --admin-password <PASS>  Enables the admin channel
//     --log-level <FILTER>     Tracing filter (default: info)
//     --log-file <FILE>        Append logs here instead of stderr

use std::path::PathBuf;
use std::sync::Arc;

use boardroom_relay::admin::{AdminServer, LogAccess, PrimaryServer, ServerControl};
use boardroom_relay::config::Config;
use boardroom_relay::logging::init_logging;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "boardroom-server", version, about = "Boardroom session server")]
struct Cli {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session bind address
    #[arg(long)]
    bind: Option<String>,

    /// Session port (0 picks one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Admin port
    #[arg(long)]
    admin_port: Option<u16>,

    /// Admin shared secret; also read from BOARDROOM_ADMIN_PASSWORD
    #[arg(long)]
    admin_password: Option<String>,

    /// Tracing filter, e.g. `info` or `boardroom_relay=debug`
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(cli: Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            eprintln!("{e}");
            std::process::exit(1);
        }),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(port) = cli.admin_port {
        config.admin.port = port;
    }
    if let Some(password) = cli.admin_password {
        config.admin.password = Some(password);
    }
    if let Some(filter) = cli.log_level {
        config.logging.filter = filter;
    }
    if let Some(file) = cli.log_file {
        config.logging.file = Some(file);
    }
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }
    config
}

fn main() {
    let config = load_config(Cli::parse());

    let logs = match init_logging(&config.logging) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(1);
        }
    };
    let log_file = logs.file().map(PathBuf::from);

    let primary = Arc::new(PrimaryServer::new(config.server.clone()));
    match primary.start() {
        Ok(Some(addr)) => println!("Session server listening on {addr}"),
        Ok(None) => {}
        Err(e) => {
            eprintln!("Failed to start session server: {e}");
            std::process::exit(1);
        }
    }

    let Some(password) = &config.admin.password else {
        info!("admin channel disabled");
        if let Some(handle) = primary.handle() {
            handle.join();
        }
        return;
    };

    let access = LogAccess {
        file: log_file,
        control: Some(Arc::new(logs)),
    };
    let admin = match AdminServer::start(&config.admin, password, primary.clone(), access) {
        Ok(admin) => admin,
        Err(e) => {
            eprintln!("Failed to start admin channel: {e}");
            primary.shutdown();
            std::process::exit(1);
        }
    };
    println!("Admin channel listening on {}", admin.addr());
    admin.join();
    println!("Shutting down...");
}
