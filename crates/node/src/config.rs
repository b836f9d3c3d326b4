//! Command line and `ixcoin.conf` handling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ixd_consensus::Network;
use ixd_log as logging;

pub(crate) const DEFAULT_DATA_DIR: &str = "data";
pub(crate) const CONF_FILE_NAME: &str = "ixcoin.conf";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    /// Print chain and mining fund status as JSON.
    Status,
    /// Recompute the mining fund from recorded deltas and compare.
    VerifyFund,
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub command: Command,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
}

#[derive(Debug)]
pub(crate) enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub(crate) fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub(crate) fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut command = Command::Status;
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            "status" => {
                let _ = args.next();
            }
            "verify-fund" => {
                command = Command::VerifyFund;
                let _ = args.next();
            }
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
                network_set = true;
            }
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        if !network_set {
            if conf_flag(&conf, "regtest", &conf_file)? == Some(true) {
                network = Network::Regtest;
            } else if conf_flag(&conf, "testnet", &conf_file)? == Some(true) {
                network = Network::Testnet;
            }
        }
        if !backend_set {
            if let Some(raw) = conf_value(&conf, "backend") {
                backend = Backend::parse(raw).ok_or_else(|| {
                    format!("invalid backend '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_level_set {
            if let Some(raw) = conf_value(&conf, "loglevel") {
                log_level = logging::Level::parse(raw).ok_or_else(|| {
                    format!("invalid loglevel '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_format_set {
            if let Some(raw) = conf_value(&conf, "logformat") {
                log_format = logging::Format::parse(raw).ok_or_else(|| {
                    format!("invalid logformat '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_timestamps_set {
            if let Some(value) = conf_flag(&conf, "logtimestamps", &conf_file)? {
                log_timestamps = value;
            }
        }
    }

    Ok(CliAction::Run(Config {
        command,
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        log_level,
        log_format,
        log_timestamps,
    }))
}

type ConfMap = HashMap<String, Vec<String>>;

/// Reads `key=value` lines. Returns `None` when the file does not exist.
pub(crate) fn load_conf(path: &Path) -> Result<Option<ConfMap>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out = ConfMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn conf_value<'a>(conf: &'a ConfMap, key: &str) -> Option<&'a str> {
    conf.get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn conf_flag(conf: &ConfMap, key: &str, conf_file: &Path) -> Result<Option<bool>, String> {
    match conf_value(conf, key) {
        Some(raw) => parse_conf_bool(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid {key} value '{raw}' in {}", conf_file.display())),
        None => Ok(None),
    }
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn usage() -> String {
    [
        "Usage:",
        "  ixd [command] [options]",
        "",
        "Commands:",
        "  status       Print chain and mining fund status as JSON (default)",
        "  verify-fund  Replay recorded mining fund deltas and compare with the stored balance",
        "  help         Print this help and exit",
        "  version      Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (fjall|memory) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/ixcoin.conf)",
        "  --network  Network selection (main|testnet|regtest) (default: main)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "",
        "Config file keys: regtest, testnet, backend, loglevel, logformat, logtimestamps",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(values: &[&str]) -> Config {
        match parse_args_from(args(values)).expect("parse") {
            CliAction::Run(config) => config,
            other => panic!("expected run config, got {other:?}"),
        }
    }

    #[test]
    fn defaults_without_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.command, Command::Status);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.log_level, logging::Level::Info);
        assert!(config.log_timestamps);
        assert_eq!(config.conf_path, dir.path().join(CONF_FILE_NAME));
    }

    #[test]
    fn commands_and_help() {
        assert!(matches!(
            parse_args_from(args(&["help"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["--version"])),
            Ok(CliAction::PrintVersion)
        ));
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = run_config(&["verify-fund", "--data-dir", &data_dir]);
        assert_eq!(config.command, Command::VerifyFund);
        assert!(parse_args_from(args(&["--bogus"])).is_err());
        assert!(parse_args_from(args(&["--backend", "sled"])).is_err());
        assert!(parse_args_from(args(&["--network"])).is_err());
    }

    #[test]
    fn conf_file_selects_network_and_logging() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# node settings\nregtest\nbackend = memory ; in-process\nLogLevel=debug\nlogtimestamps=0\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.log_level, logging::Level::Debug);
        assert!(!config.log_timestamps);
    }

    #[test]
    fn command_line_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("custom.conf");
        fs::write(&conf, "regtest=1\nloglevel=debug\nlogformat=json\n").expect("write conf");
        let conf = conf.to_string_lossy().into_owned();
        let config = run_config(&[
            "--conf",
            &conf,
            "--network",
            "testnet",
            "--log-level",
            "warn",
        ]);
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.log_level, logging::Level::Warn);
        assert_eq!(config.log_format, logging::Format::Json);
    }

    #[test]
    fn invalid_conf_values_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join(CONF_FILE_NAME);
        fs::write(&conf, "testnet=maybe\n").expect("write conf");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let err = parse_args_from(args(&["--data-dir", &data_dir])).unwrap_err();
        assert!(err.contains("invalid testnet value 'maybe'"), "{err}");
    }

    #[test]
    fn conf_parsing_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONF_FILE_NAME);
        assert!(load_conf(&path).expect("load").is_none());

        fs::write(&path, "; comment\n\nfoo\nBar = 1\nbar=2 # trailing\n=orphan\n").expect("write");
        let conf = load_conf(&path).expect("load").expect("conf");
        assert_eq!(conf_value(&conf, "foo"), Some("1"));
        assert_eq!(conf.get("bar"), Some(&vec!["1".to_string(), "2".to_string()]));
        assert_eq!(conf_value(&conf, "bar"), Some("2"));
        assert_eq!(conf.len(), 2);
    }

    #[test]
    fn conf_bools() {
        assert_eq!(parse_conf_bool(""), Some(true));
        assert_eq!(parse_conf_bool("YES"), Some(true));
        assert_eq!(parse_conf_bool("0"), Some(false));
        assert_eq!(parse_conf_bool("off"), None);
    }
}
