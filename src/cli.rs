use clap::{value_parser, Arg, ArgAction, Command};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub fn build_cli() -> Command {
    Command::new("token-meter")
        .about("Anthropic API rate-limit monitor")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .global(true)
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help("Append logs to this file instead of stderr"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .help("Config file path (overrides $TOKEN_METER_CONFIG)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("watch")
                .about("Poll on the configured interval and print every update (default)")
                .arg(json_flag()),
        )
        .subcommand(
            Command::new("once")
                .about("Probe once, print the limits and exit")
                .arg(json_flag()),
        )
        .subcommand(
            Command::new("set-interval")
                .about("Persist the auto-refresh interval")
                .arg(
                    Arg::new("seconds")
                        .required(true)
                        .value_parser(value_parser!(u64))
                        .help("30, 60, 300, 900 or a custom value of at least 30"),
                ),
        )
        .subcommand(Command::new("set-key").about("Read an API key from stdin and persist it"))
        .subcommand(Command::new("config-path").about("Print the config file path"))
}

fn json_flag() -> Arg {
    Arg::new("json")
        .long("json")
        .help("Print updates as JSON lines")
        .action(ArgAction::SetTrue)
}

pub fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> anyhow::Result<()> {
    // Explicit level wins, else RUST_LOG, else info.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(lvl) = level {
        builder.parse_filters(lvl);
    }
    if let Some(path) = log_file {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}
