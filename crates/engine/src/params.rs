//! Parameter layer: environment variables override the configuration
//! file, which overrides compiled defaults.

use std::path::PathBuf;

use kvtree::KvTree;
use redundancy::Scheme;

use crate::ScrError;

/// Default control directory base.
pub const DEFAULT_CNTL_BASE: &str = "/tmp";
/// Default cache directory base.
pub const DEFAULT_CACHE_BASE: &str = "/tmp";
/// Default system configuration file.
pub const DEFAULT_CONF_FILE: &str = "/etc/scr.conf";

/// Resolved run parameters.
#[derive(Clone, Debug)]
pub struct Params {
    /// Master switch.
    pub enabled: bool,
    /// Debug verbosity (0 quiet).
    pub debug: u8,
    /// Whether event/transfer records are written.
    pub log_enable: bool,
    /// Owning user, required.
    pub username: Option<String>,
    /// Job id, required.
    pub jobid: Option<String>,
    /// Job name tying runs together.
    pub jobname: Option<String>,
    /// Control directory base.
    pub cntl_base: PathBuf,
    /// Cache directory base.
    pub cache_base: PathBuf,
    /// Datasets allowed per cache base.
    pub cache_size: usize,
    /// Default redundancy scheme.
    pub copy_type: Scheme,
    /// Ranks per XOR set.
    pub set_size: usize,
    /// Node distance to partners.
    pub hop_distance: usize,
    /// Halt margin in seconds.
    pub halt_seconds: u64,
    /// Message chunk size for codec streaming.
    pub mpi_buf_size: usize,
    /// Buffer size for file copies.
    pub file_buf_size: usize,
    /// Whether to redistribute cached files at init.
    pub distribute: bool,
    /// Whether to fetch from the PFS at init.
    pub fetch: bool,
    /// Max ranks reading from the PFS at once.
    pub fetch_width: usize,
    /// Flush every N checkpoints; 0 disables flushing.
    pub flush: u64,
    /// Max ranks writing to the PFS at once.
    pub flush_width: usize,
    /// Whether to flush the recovered dataset on restart.
    pub flush_on_restart: bool,
    /// Restart must come from the PFS: disables fetch, forces flush.
    pub global_restart: bool,
    /// Whether flushes run through the external mover.
    pub flush_async: bool,
    /// Mover bandwidth budget, bytes/sec.
    pub flush_async_bw: f64,
    /// Mover CPU budget, percent.
    pub flush_async_percent: f64,
    /// CRC verification during redundancy copies.
    pub crc_on_copy: bool,
    /// CRC verification during flush and fetch.
    pub crc_on_flush: bool,
    /// CRC verification when deleting cached files.
    pub crc_on_delete: bool,
    /// Checkpoint every N calls to `need_checkpoint`; 0 disables.
    pub checkpoint_interval: u64,
    /// Minimum seconds between checkpoints; 0 disables.
    pub checkpoint_seconds: u64,
    /// Max percent runtime spent checkpointing; 0 disables.
    pub checkpoint_overhead: f64,
    /// PFS prefix.
    pub prefix: PathBuf,
    /// Descriptor entries from the configuration file (`CKPT` lines).
    pub ckpt_entries: KvTree,
}

/// Parses a byte count with optional `KB`/`MB`/`GB` suffix.
pub fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let base: u64 = digits.parse().ok()?;
    let factor = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        _ => return None,
    };
    Some(base * factor)
}

impl Params {
    /// Resolves parameters through `lookup` (environment plus test
    /// overrides) backed by the configuration tree.
    pub fn resolve(
        lookup: impl Fn(&str) -> Option<String>,
        config: &KvTree,
    ) -> Result<Self, ScrError> {
        let get = |key: &str| -> Option<String> {
            lookup(key).or_else(|| config.get_str(key).map(str::to_owned))
        };
        let get_bool = |key: &str, default: bool| -> bool {
            get(key).map_or(default, |v| v.trim() != "0")
        };
        let get_u64 = |key: &str, default: u64| -> u64 {
            get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let get_f64 = |key: &str, default: f64| -> f64 {
            get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let get_size = |key: &str, default: usize| -> usize {
            get(key)
                .and_then(|v| parse_bytes(&v))
                .map_or(default, |v| v as usize)
        };

        let copy_type = match get("SCR_COPY_TYPE") {
            Some(value) => Scheme::parse(&value).ok_or_else(|| {
                ScrError::ConfigInvalid(format!("unknown SCR_COPY_TYPE '{value}'"))
            })?,
            None => Scheme::Xor,
        };

        let prefix = get("SCR_PREFIX").map(PathBuf::from).unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        });

        let fetch_width = get_u64("SCR_FETCH_WIDTH", 256) as usize;
        Ok(Self {
            enabled: get_bool("SCR_ENABLE", true),
            debug: get_u64("SCR_DEBUG", 0) as u8,
            log_enable: get_bool("SCR_LOG_ENABLE", true),
            username: get("SCR_USER_NAME").or_else(|| lookup("USER")),
            jobid: get("SCR_JOB_ID").or_else(|| lookup("SLURM_JOBID")),
            jobname: get("SCR_JOB_NAME"),
            cntl_base: get("SCR_CNTL_BASE")
                .map_or_else(|| PathBuf::from(DEFAULT_CNTL_BASE), PathBuf::from),
            cache_base: get("SCR_CACHE_BASE")
                .map_or_else(|| PathBuf::from(DEFAULT_CACHE_BASE), PathBuf::from),
            cache_size: get_u64("SCR_CACHE_SIZE", 1) as usize,
            copy_type,
            set_size: get_u64("SCR_SET_SIZE", 8) as usize,
            hop_distance: get_u64("SCR_HOP_DISTANCE", 1) as usize,
            halt_seconds: get_u64("SCR_HALT_SECONDS", 0),
            mpi_buf_size: get_size("SCR_MPI_BUF_SIZE", 128 * 1024),
            file_buf_size: get_size("SCR_FILE_BUF_SIZE", 1024 * 1024),
            distribute: get_bool("SCR_DISTRIBUTE", true),
            fetch: get_bool("SCR_FETCH", true),
            fetch_width,
            flush: get_u64("SCR_FLUSH", 10),
            flush_width: get_u64("SCR_FLUSH_WIDTH", fetch_width as u64) as usize,
            flush_on_restart: get_bool("SCR_FLUSH_ON_RESTART", false),
            global_restart: get_bool("SCR_GLOBAL_RESTART", false),
            flush_async: get_bool("SCR_FLUSH_ASYNC", false),
            flush_async_bw: get_f64("SCR_FLUSH_ASYNC_BW", 200.0 * 1024.0 * 1024.0),
            flush_async_percent: get_f64("SCR_FLUSH_ASYNC_PERCENT", 0.0),
            crc_on_copy: get_bool("SCR_CRC_ON_COPY", false),
            crc_on_flush: get_bool("SCR_CRC_ON_FLUSH", true),
            crc_on_delete: get_bool("SCR_CRC_ON_DELETE", false),
            checkpoint_interval: get_u64("SCR_CHECKPOINT_INTERVAL", 0),
            checkpoint_seconds: get_u64("SCR_CHECKPOINT_SECONDS", 0),
            checkpoint_overhead: get_f64("SCR_CHECKPOINT_OVERHEAD", 0.0),
            prefix,
            ckpt_entries: config.get("CKPT").cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_suffixes() {
        assert_eq!(parse_bytes("1024"), Some(1024));
        assert_eq!(parse_bytes("128KB"), Some(128 * 1024));
        assert_eq!(parse_bytes("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_bytes("1GB"), Some(1 << 30));
        assert_eq!(parse_bytes("7XB"), None);
    }

    #[test]
    fn env_beats_config_beats_default() {
        let config = crate::config::parse("SCR_CACHE_SIZE=5\nSCR_SET_SIZE=16\n").unwrap();
        let params = Params::resolve(
            |key| match key {
                "SCR_CACHE_SIZE" => Some("3".into()),
                "USER" => Some("alice".into()),
                "SCR_JOB_ID" => Some("j1".into()),
                _ => None,
            },
            &config,
        )
        .unwrap();

        assert_eq!(params.cache_size, 3); // env wins
        assert_eq!(params.set_size, 16); // config wins
        assert_eq!(params.hop_distance, 1); // default
        assert_eq!(params.username.as_deref(), Some("alice"));
    }
}
