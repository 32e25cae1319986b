mod cli;

use std::path::PathBuf;
use token_meter::config::{ClientConfig, ConfigResolver, API_KEY_ENV};
use token_meter::console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::build_cli();
    let matches = cmd.get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    let log_file = matches.get_one::<PathBuf>("log-file").cloned();
    let version_flag = matches.get_flag("version");

    cli::init_logging(log_level.as_deref(), log_file.as_deref())?;

    if version_flag {
        println!("token-meter {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut resolver = match matches.get_one::<PathBuf>("config") {
        Some(path) => ConfigResolver::new(path).with_env_api_key(std::env::var(API_KEY_ENV).ok()),
        None => ConfigResolver::from_env()?,
    };
    let client = ClientConfig::from_env();

    match matches.subcommand() {
        Some(("once", sub)) => console::run_once(&resolver, client, sub.get_flag("json")).await,
        Some(("set-interval", sub)) => {
            let secs = sub.get_one::<u64>("seconds").copied().unwrap_or_default();
            console::set_interval(&mut resolver, secs)
        }
        Some(("set-key", _)) => console::set_key_from(&mut resolver, std::io::stdin().lock()),
        Some(("config-path", _)) => {
            println!("{}", resolver.path().display());
            Ok(())
        }
        Some(("watch", sub)) => console::run_watch(resolver, client, sub.get_flag("json")).await,
        _ => console::run_watch(resolver, client, false).await,
    }
}
