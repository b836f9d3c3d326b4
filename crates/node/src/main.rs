use ixd_log as logging;
use ixd_log::{log_error, log_info, log_warn};

mod config;
mod status;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use ixd_chainstate::state::ChainState;
use ixd_consensus::{chain_params, hash256_to_hex, ChainParams};
use ixd_storage::fjall::{FjallOptions, FjallStore};
use ixd_storage::memory::MemoryStore;
use ixd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

use crate::config::{parse_args, usage, Backend, CliAction, Command, Config};
use crate::status::{verify_fund, StatusReport};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another ixd instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another ixd instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("ixd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config),
    }
}

fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    let start_time = Instant::now();
    let params = chain_params(config.network);
    let data_dir = network_data_dir(&config.data_dir, &params);
    log_info!(
        "Startup: begin (backend={:?}, network={}, data_dir={}, conf={})",
        config.backend,
        config.network,
        data_dir.display(),
        config.conf_path.display()
    );

    fs::create_dir_all(&data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&data_dir)?;

    let store = Arc::new(open_store(config.backend, &data_dir.join("db"))?);
    let chainstate = ChainState::new(Arc::clone(&store), params).map_err(|err| {
        log_error!("Failed to open chain state: {err}");
        err.to_string()
    })?;
    if let Some(hash) = chainstate.ensure_genesis().map_err(|err| err.to_string())? {
        log_info!("Initialized new chain at genesis {}", hash256_to_hex(&hash));
    }
    log_info!(
        "Startup: chain state ready in {}ms",
        start_time.elapsed().as_millis()
    );

    match config.command {
        Command::Status => {
            let status = chainstate.chain_status().map_err(|err| err.to_string())?;
            let report = StatusReport::from_status(&status);
            let json = serde_json::to_string_pretty(&report).map_err(|err| err.to_string())?;
            println!("{json}");
        }
        Command::VerifyFund => {
            let verification = verify_fund(&chainstate);
            let json =
                serde_json::to_string_pretty(&verification).map_err(|err| err.to_string())?;
            println!("{json}");
            if let Some(err) = &verification.error {
                log_error!("Mining fund verification failed: {err}");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn network_data_dir(base: &Path, params: &ChainParams) -> PathBuf {
    match params.data_subdir {
        Some(subdir) => base.join(subdir),
        None => base.to_path_buf(),
    }
}

fn open_store(backend: Backend, db_path: &Path) -> Result<Store, String> {
    match backend {
        Backend::Memory => {
            log_warn!("Using in-memory store; chain state is discarded on exit");
            Ok(Store::Memory(MemoryStore::new()))
        }
        Backend::Fjall => {
            let options = FjallOptions {
                sync_commits: true,
                ..FjallOptions::default()
            };
            Ok(Store::Fjall(
                FjallStore::open_with_options(db_path, options).map_err(|err| err.to_string())?,
            ))
        }
    }
}
