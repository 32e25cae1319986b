//! Terminal front end: `watch` reads the menu's actions as stdin lines,
//! `once` probes a single time.

use crate::config::{ApiKey, ClientConfig, ConfigError, ConfigResolver};
use crate::display;
use crate::http::{LimitClient, Probe};
use crate::scheduler::{MeterUpdate, PauseReason, Phase, PollScheduler, SchedulerHandle};
use crate::state::LimitState;
use anyhow::Context;
use chrono::Utc;
use log::{info, warn};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str =
    "commands: r(efresh) | i(nterval) <secs> | k(ey) <api-key> | p(ause) | resume | q(uit)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Refresh,
    Interval(u64),
    Key(String),
    Pause,
    Resume,
    Quit,
    Help,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Err("empty command".into());
    };
    let arg = parts.next();
    match word.to_ascii_lowercase().as_str() {
        "r" | "refresh" => Ok(ConsoleCommand::Refresh),
        "i" | "interval" => {
            let raw = arg.ok_or("interval needs a number of seconds")?;
            raw.parse::<u64>()
                .map(ConsoleCommand::Interval)
                .map_err(|_| format!("not a number of seconds: {}", raw))
        }
        "k" | "key" => arg
            .map(|k| ConsoleCommand::Key(k.to_string()))
            .ok_or_else(|| "key needs a value".to_string()),
        "p" | "pause" => Ok(ConsoleCommand::Pause),
        "resume" => Ok(ConsoleCommand::Resume),
        "q" | "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "h" | "help" | "?" => Ok(ConsoleCommand::Help),
        other => Err(format!("unknown command: {}", other)),
    }
}

fn render(update: &MeterUpdate, json: bool) {
    if json {
        match serde_json::to_string(update) {
            Ok(s) => println!("{}", s),
            Err(e) => warn!("failed to encode update: {}", e),
        }
    } else {
        println!(
            "{}\n",
            display::render_report(&update.state, &update.capacity, Utc::now())
        );
    }
}

/// Probe once and print the result. Errors are printed as part of the report
/// and then returned so the process exits non-zero.
pub async fn run_once(
    resolver: &ConfigResolver,
    client: ClientConfig,
    json: bool,
) -> anyhow::Result<()> {
    let config = resolver.resolve()?;
    let client = LimitClient::new(client).context("failed to build HTTP client")?;
    let mut state = LimitState::default();
    let result = client.probe(&config.api_key).await;
    match &result {
        Ok(report) => state.apply_success(report, Utc::now()),
        Err(err) => state.apply_failure(err, Utc::now()),
    }
    render(&MeterUpdate::from_state(&state), json);
    result.map(|_| ()).map_err(anyhow::Error::from)
}

/// Run the poll loop until `quit`, EOF on a closed scheduler, or Ctrl-C.
pub async fn run_watch(
    mut resolver: ConfigResolver,
    client: ClientConfig,
    json: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let config = match resolver.resolve() {
        Ok(c) => c,
        Err(ConfigError::MissingCredential) => {
            println!("No API key found. Enter your Anthropic API key:");
            let key = loop {
                match lines.next_line().await? {
                    Some(line) => match ApiKey::parse(&line) {
                        Some(k) => break k,
                        None => println!("Key cannot be empty. Enter your Anthropic API key:"),
                    },
                    None => return Err(ConfigError::MissingCredential.into()),
                }
            };
            resolver.update_api_key(key)?;
            resolver.resolve()?
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        "starting watch refresh_seconds={} key_source={:?}",
        config.refresh_seconds, config.key_source
    );

    let probe: Arc<dyn Probe> =
        Arc::new(LimitClient::new(client).context("failed to build HTTP client")?);
    let handle =
        PollScheduler::new(probe, config.api_key.clone(), config.refresh_interval()).spawn();
    let mut updates = handle.subscribe();
    let mut phase = handle.phase_watch();
    eprintln!("{}", HELP);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(u) => render(&u, json),
                Err(RecvError::Lagged(n)) => warn!("console skipped {} updates", n),
                Err(RecvError::Closed) => break,
            },
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *phase.borrow_and_update();
                if current == (Phase::Paused { reason: PauseReason::Credentials }) {
                    eprintln!("API key rejected. Enter `key <new-key>` to resume polling.");
                }
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(cmd) => {
                        if let Err(e) = apply(cmd, &mut resolver, &handle) {
                            eprintln!("error: {:#}", e);
                        }
                    }
                    Err(msg) => eprintln!("{}\n{}", msg, HELP),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn apply(
    cmd: ConsoleCommand,
    resolver: &mut ConfigResolver,
    handle: &SchedulerHandle,
) -> anyhow::Result<()> {
    match cmd {
        ConsoleCommand::Refresh => handle.refresh_now()?,
        ConsoleCommand::Interval(secs) => {
            let secs = resolver.update_refresh_seconds(secs)?;
            handle.set_interval(Duration::from_secs(secs))?;
            eprintln!("auto-refresh every {}s", secs);
        }
        ConsoleCommand::Key(raw) => {
            let key = ApiKey::parse(&raw).ok_or(ConfigError::MissingCredential)?;
            resolver.update_api_key(key.clone())?;
            handle.set_api_key(key)?;
        }
        ConsoleCommand::Pause => handle.pause()?,
        ConsoleCommand::Resume => handle.resume()?,
        ConsoleCommand::Help => eprintln!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

pub fn set_interval(resolver: &mut ConfigResolver, secs: u64) -> anyhow::Result<()> {
    let secs = resolver.update_refresh_seconds(secs)?;
    println!("refresh_seconds = {} ({})", secs, resolver.path().display());
    Ok(())
}

/// Reads the key from the first non-empty line of `input`, so it never
/// shows up in shell history or the process list.
pub fn set_key_from<R: BufRead>(resolver: &mut ConfigResolver, input: R) -> anyhow::Result<()> {
    for line in input.lines() {
        if let Some(key) = ApiKey::parse(&line?) {
            resolver.update_api_key(key)?;
            println!("API key saved to {}", resolver.path().display());
            return Ok(());
        }
    }
    Err(ConfigError::MissingCredential.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_menu_actions() {
        assert_eq!(parse_command("r"), Ok(ConsoleCommand::Refresh));
        assert_eq!(parse_command("  Refresh "), Ok(ConsoleCommand::Refresh));
        assert_eq!(parse_command("i 30"), Ok(ConsoleCommand::Interval(30)));
        assert_eq!(parse_command("interval 900"), Ok(ConsoleCommand::Interval(900)));
        assert_eq!(
            parse_command("key sk-ant-1"),
            Ok(ConsoleCommand::Key("sk-ant-1".into()))
        );
        assert_eq!(parse_command("pause"), Ok(ConsoleCommand::Pause));
        assert_eq!(parse_command("resume"), Ok(ConsoleCommand::Resume));
        assert_eq!(parse_command("q"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("").is_err());
        assert!(parse_command("i").is_err());
        assert!(parse_command("i soon").is_err());
        assert!(parse_command("key").is_err());
        assert!(parse_command("launch").is_err());
    }

    #[test]
    fn set_key_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = ConfigResolver::new(dir.path().join("config.json"));
        set_key_from(&mut r, "\n  \nsk-from-stdin\n".as_bytes()).unwrap();
        assert_eq!(r.resolve().unwrap().api_key.expose(), "sk-from-stdin");

        let mut empty = ConfigResolver::new(dir.path().join("other.json"));
        assert!(set_key_from(&mut empty, "".as_bytes()).is_err());
    }
}
