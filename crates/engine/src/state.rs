//! The orchestrator: one [`Scr`] value per process owns every piece of
//! library state and exposes the six-call public API.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use cache::CacheCtx;
use fetch::FetchCtx;
use filemap::Filemap;
use flush::flushfile::{self, Location};
use flush::nonblocking::AsyncFlush;
use flush::{Dataset, FlushCtx};
use group::{Communicator, ReduceOp, Topology};
use halt::HaltState;
use kvtree::KvTree;
use logging::Diag;
use meta::{FileKind, FileMeta};
use redundancy::{CodecCtx, Descriptor, DescriptorConfig, Scheme};

use crate::{Params, ScrError, config};

/// Optional hook returning the seconds left in the allocation.
pub type SecsRemaining = Box<dyn Fn() -> Option<u64> + Send>;

/// Knobs for [`Scr::init`] beyond the environment.
pub struct InitOptions {
    /// Hostname override; defaults to the real hostname. Tests use this
    /// to lay ranks out across synthetic nodes.
    pub hostname: Option<String>,
    /// Parameter overrides consulted before the environment.
    pub overrides: Vec<(String, String)>,
    /// Inline configuration tree consulted instead of `SCR_CONF_FILE`.
    pub config: Option<KvTree>,
    /// Remaining-seconds oracle.
    pub secs_remaining: Option<SecsRemaining>,
    /// Whether a halt condition exits the process (the production
    /// behavior) or surfaces as [`ScrError::Halted`].
    pub halt_exits: bool,
    /// Sleep between async flush polls.
    pub poll_interval: Duration,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            overrides: Vec::new(),
            config: None,
            secs_remaining: None,
            halt_exits: true,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Library state; exactly one per process between `init` and `finalize`.
pub struct Scr {
    topo: Topology,
    params: Params,
    descriptors: Vec<Descriptor>,
    map: Filemap,

    cntl_dir: PathBuf,
    map_file: PathBuf,
    master_map_file: PathBuf,
    halt_file: PathBuf,
    flush_file: PathBuf,
    nodes_file: PathBuf,
    transfer_file: PathBuf,

    halt: HaltState,
    secs_remaining: Option<SecsRemaining>,
    halt_exits: bool,
    poll_interval: Duration,

    dataset_id: u64,
    in_checkpoint: bool,
    need_count: u64,

    ckpt_cost_total: f64,
    ckpt_count: u64,
    time_ckpt_start: Instant,
    time_ckpt_end: Instant,

    async_flush: Option<AsyncFlush>,
    diag: Diag,
}

impl Scr {
    /// Initializes the library over `world`: read parameters, build the
    /// topology and descriptor table, set up the control directory, and
    /// recover the latest cached dataset (redistribute, rebuild, or
    /// fetch).
    pub fn init(world: Box<dyn Communicator>, opts: InitOptions) -> Result<Self, ScrError> {
        let lookup = |key: &str| -> Option<String> {
            opts.overrides
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .or_else(|| std::env::var(key).ok())
        };

        // quick exit before any collective work
        if lookup("SCR_ENABLE").is_some_and(|v| v.trim() == "0") {
            return Err(ScrError::Disabled);
        }

        // rank 0 reads the configuration file, everyone gets a copy
        let mut config_tree = if world.rank() == 0 {
            match &opts.config {
                Some(tree) => tree.clone(),
                None => {
                    let path = lookup("SCR_CONF_FILE")
                        .map_or_else(|| PathBuf::from(crate::params::DEFAULT_CONF_FILE), PathBuf::from);
                    config::read(&path)?
                }
            }
        } else {
            KvTree::new()
        };
        kvtree::exchange::bcast(&mut config_tree, 0, world.as_ref())?;

        let mut params = Params::resolve(lookup, &config_tree)?;
        if !params.enabled {
            return Err(ScrError::Disabled);
        }
        if params.global_restart {
            params.flush_on_restart = true;
            params.fetch = false;
        }

        let username = params
            .username
            .clone()
            .ok_or_else(|| ScrError::ConfigInvalid("SCR_USER_NAME is not set".into()))?;
        let jobid = params
            .jobid
            .clone()
            .ok_or_else(|| ScrError::ConfigInvalid("SCR_JOB_ID is not set".into()))?;

        let hostname = opts.hostname.clone().unwrap_or_else(fileio::hostname);
        let topo = Topology::build(world, hostname)?;
        let diag = Diag::new(topo.rank_world(), topo.hostname(), params.debug);

        // descriptor table: config CKPT entries, or one from the scheme
        let configs = descriptor_configs(&params, &username, &jobid)?;
        let mut descriptors = Vec::with_capacity(configs.len());
        for config in &configs {
            descriptors.push(Descriptor::create(config, &topo)?);
        }
        if !descriptors.iter().any(|d| d.enabled && d.interval == 1) {
            return Err(ScrError::ConfigInvalid(
                "no enabled redundancy descriptor with interval 1".into(),
            ));
        }

        // control and cache directories, created once per node
        let cntl_dir = params.cntl_base.join(&username).join(format!("scr.{jobid}"));
        if topo.rank_local() == 0 {
            diag.dbg(2, format!("creating control directory {}", cntl_dir.display()));
            fileio::mkdir_p(&cntl_dir)?;
            for desc in descriptors.iter().filter(|d| d.enabled) {
                diag.dbg(
                    2,
                    format!("creating cache directory {}", desc.directory.display()),
                );
                fileio::mkdir_p(&desc.directory)?;
            }
        }
        topo.local().barrier()?;

        let map_file = cntl_dir.join(format!("filemap_{}.scr", topo.rank_local()));
        let master_map_file = cntl_dir.join("filemap.scr");
        let halt_file = cntl_dir.join("halt.scr");
        let flush_file = cntl_dir.join("flush.scr");
        let nodes_file = cntl_dir.join("nodes.scr");
        let transfer_file = cntl_dir.join("transfer.scr");

        // a transfer interrupted by the previous run is abandoned
        if topo.rank_local() == 0 {
            let _ = std::fs::remove_file(&transfer_file);
        }

        // record the node count for post-job tooling
        let num_nodes = topo.num_nodes()?;
        if topo.rank_local() == 0 {
            let mut nodes = KvTree::new();
            nodes.set_u64("NODES", num_nodes as u64);
            nodes.write_file(&nodes_file)?;
        }

        let mut halt_state = HaltState::new();
        if params.halt_seconds > 0 {
            halt_state.set_halt_seconds(params.halt_seconds);
        }

        topo.world().barrier()?;

        let now = Instant::now();
        let mut scr = Self {
            topo,
            params,
            descriptors,
            map: Filemap::new(),
            cntl_dir,
            map_file,
            master_map_file,
            halt_file,
            flush_file,
            nodes_file,
            transfer_file,
            halt: halt_state,
            secs_remaining: opts.secs_remaining,
            halt_exits: opts.halt_exits,
            poll_interval: opts.poll_interval,
            dataset_id: 0,
            in_checkpoint: false,
            need_count: 0,
            ckpt_cost_total: 0.0,
            ckpt_count: 0,
            time_ckpt_start: now,
            time_ckpt_end: now,
            async_flush: None,
            diag,
        };

        // exit right away if the job was told to halt before we started
        scr.check_halt(true, 0)?;

        scr.restart()?;

        scr.topo.world().barrier()?;
        scr.time_ckpt_end = Instant::now();
        Ok(scr)
    }

    /// The control directory in use.
    #[must_use]
    pub fn cntl_dir(&self) -> &Path {
        &self.cntl_dir
    }

    /// Id of the dataset in cache, 0 when none.
    #[must_use]
    pub fn dataset_id(&self) -> u64 {
        self.dataset_id
    }

    /// The job topology.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Dataset ids this rank currently tracks in cache, ascending.
    #[must_use]
    pub fn cached_datasets(&self) -> Vec<u64> {
        self.map.datasets()
    }

    fn flush_ctx(&self) -> FlushCtx<'_> {
        FlushCtx {
            topo: &self.topo,
            prefix: &self.params.prefix,
            flush_file: &self.flush_file,
            transfer_file: &self.transfer_file,
            flush_width: self.params.flush_width,
            file_buf_size: self.params.file_buf_size,
            crc_on_flush: self.params.crc_on_flush,
            flush_async_bw: self.params.flush_async_bw,
            flush_async_percent: self.params.flush_async_percent,
            jobid: self.params.jobid.as_deref().unwrap_or("nojob"),
            poll_interval: self.poll_interval,
            diag: &self.diag,
        }
    }

    fn dataset_info(&self, id: u64) -> Dataset {
        Dataset {
            id,
            name: String::new(),
            created: logging::now_secs(),
            user: self.params.username.clone(),
            jobid: self.params.jobid.clone(),
            jobname: self.params.jobname.clone(),
            size: 0,
            files: 0,
            is_checkpoint: true,
            is_output: false,
        }
    }

    /// Recover whatever the cache still holds, falling back to a PFS
    /// fetch, and leave at most the most recent dataset in cache.
    fn restart(&mut self) -> Result<(), ScrError> {
        let mut recovered = false;

        if self.params.distribute {
            recovered = self.distribute_and_rebuild()?;
            if recovered {
                self.trim_to_latest()?;
                if self.params.flush_on_restart {
                    self.flush_current_sync()?;
                } else {
                    self.check_flush()?;
                }
            }
        }

        if !recovered || self.params.global_restart {
            let mut cctx = self.cache_ctx_owned();
            cache::unlink_all(&mut cctx)?;
            self.dataset_id = 0;
            recovered = false;
        }

        if !recovered && self.params.fetch {
            let fctx = FetchCtx {
                prefix: &self.params.prefix,
                fetch_width: self.params.fetch_width,
                file_buf_size: self.params.file_buf_size,
                crc_on_flush: self.params.crc_on_flush,
            };
            let mut cctx = CacheCtx {
                topo: &self.topo,
                map: &mut self.map,
                map_file: &self.map_file,
                master_map_file: &self.master_map_file,
                cntl_dir: &self.cntl_dir,
                flush_file: &self.flush_file,
                buf_size: self.params.mpi_buf_size,
                crc_on_delete: self.params.crc_on_delete,
                crc_on_copy: self.params.crc_on_copy,
                diag: &self.diag,
            };
            match fetch::fetch_any(&fctx, &mut cctx, &self.descriptors) {
                Ok(id) => {
                    self.dataset_id = id;
                    self.diag
                        .dbg(1, format!("restart fetched dataset {id} from the PFS"));
                }
                Err(err) => {
                    self.diag
                        .dbg(1, format!("no dataset fetched from the PFS: {err}"));
                    let mut cctx = self.cache_ctx_owned();
                    cache::unlink_all(&mut cctx)?;
                    self.dataset_id = 0;
                }
            }
        }

        Ok(())
    }

    fn cache_ctx_owned(&mut self) -> CacheCtx<'_> {
        CacheCtx {
            topo: &self.topo,
            map: &mut self.map,
            map_file: &self.map_file,
            master_map_file: &self.master_map_file,
            cntl_dir: &self.cntl_dir,
            flush_file: &self.flush_file,
            buf_size: self.params.mpi_buf_size,
            crc_on_delete: self.params.crc_on_delete,
            crc_on_copy: self.params.crc_on_copy,
            diag: &self.diag,
        }
    }

    /// Gather filemaps on each node, then redistribute and rebuild the
    /// most recent dataset that survives. Returns whether one did.
    fn distribute_and_rebuild(&mut self) -> Result<bool, ScrError> {
        {
            let mut cctx = self.cache_ctx_owned();
            cache::gather_scatter(&mut cctx)?;
        }

        loop {
            {
                let mut cctx = self.cache_ctx_owned();
                cache::clean_files(&mut cctx)?;
            }

            let latest = self.map.latest_dataset().map_or(-1, |id| id as i64);
            let max_id = self.topo.world().allreduce_i64(latest, ReduceOp::Max)?;
            if max_id < 0 {
                return Ok(false);
            }
            let id = max_id as u64;
            self.diag
                .dbg(1, format!("attempting to redistribute and rebuild dataset {id}"));

            let attempt = self.try_recover_dataset(id);
            let ok = attempt.is_ok();
            if self.topo.world().alltrue(ok)? {
                self.dataset_id = id;
                self.diag.dbg(1, format!("rebuilt dataset {id}"));

                let local = self.topo.local();
                flushfile::location_set(&self.flush_file, id, Location::Cache, local)?;
                // if any node believes the dataset reached the PFS,
                // every node should agree
                let in_pfs =
                    flushfile::location_test(&self.flush_file, id, Location::Pfs, local)?;
                if !self.topo.world().alltrue(!in_pfs)? {
                    flushfile::location_set(&self.flush_file, id, Location::Pfs, local)?;
                }
                flushfile::location_unset(&self.flush_file, id, Location::Flushing, local)?;
                return Ok(true);
            }

            if let Err(err) = attempt {
                self.diag
                    .dbg(1, format!("failed to redistribute and rebuild dataset {id}: {err}"));
            }
            let mut cctx = self.cache_ctx_owned();
            cache::delete_dataset(&mut cctx, id)?;
        }
    }

    fn try_recover_dataset(&mut self, id: u64) -> Result<(), ScrError> {
        let desc = {
            let mut cctx = self.cache_ctx_owned();
            let desc_tree = cache::distribute_descriptors(&mut cctx, id)?;
            Descriptor::from_stored(&desc_tree, &self.topo)?
        };

        {
            let cctx = self.cache_ctx_owned();
            cache::dataset_dir_create(&cctx, &desc, id)?;
        }
        {
            let mut cctx = self.cache_ctx_owned();
            cache::distribute_files(&mut cctx, &desc, id)?;
        }

        let mut codec = CodecCtx {
            world: self.topo.world(),
            map: &mut self.map,
            map_file: &self.map_file,
            buf_size: self.params.mpi_buf_size,
            crc_on_copy: self.params.crc_on_copy,
            diag: &self.diag,
        };
        redundancy::rebuild(&mut codec, &desc, id)?;
        Ok(())
    }

    /// Delete every cached dataset except the most recent.
    fn trim_to_latest(&mut self) -> Result<(), ScrError> {
        loop {
            let num = self.map.num_datasets() as i64;
            let max_num = self.topo.world().allreduce_i64(num, ReduceOp::Max)?;
            if max_num <= 1 {
                return Ok(());
            }
            let oldest = self.map.oldest_dataset().map_or(i64::MAX, |id| id as i64);
            let min_id = self.topo.world().allreduce_i64(oldest, ReduceOp::Min)?;
            if min_id == i64::MAX || min_id == self.dataset_id as i64 {
                return Ok(());
            }
            let mut cctx = self.cache_ctx_owned();
            cache::delete_dataset(&mut cctx, min_id as u64)?;
        }
    }

    /// Reads the halt file and evaluates halt conditions. With
    /// `and_halt`, a firing condition finishes or cancels any flush and
    /// terminates the job.
    fn check_halt(&mut self, and_halt: bool, decrement: u64) -> Result<bool, ScrError> {
        let world = self.topo.world();
        let mut reason_bytes = Vec::new();
        if world.rank() == 0 {
            self.halt.sync_and_decrement(&self.halt_file, decrement)?;
            let now = logging::now_secs();
            let remaining = self.secs_remaining.as_ref().and_then(|f| f());
            if let Some(reason) = self.halt.check(now, remaining) {
                reason_bytes = reason.as_str().as_bytes().to_vec();
                if and_halt {
                    self.diag.dbg(0, format!("job exiting: {}", reason.as_str()));
                    self.halt.set_reason(reason.as_str());
                    self.halt.sync_and_decrement(&self.halt_file, 0)?;
                }
            }
        }
        world.bcast(0, &mut reason_bytes)?;
        let need_halt = !reason_bytes.is_empty();

        if need_halt && and_halt {
            let reason = String::from_utf8_lossy(&reason_bytes).into_owned();

            if let Some(state) = self.async_flush.take() {
                let fctx = self.flush_ctx();
                if state.dataset == self.dataset_id {
                    flush::nonblocking::stop(&fctx, &state)?;
                } else {
                    let info = self.dataset_info(state.dataset);
                    flush::nonblocking::wait(&fctx, &self.map, &state, &info)?;
                }
            }
            self.flush_current_sync()?;

            self.topo.world().barrier()?;
            if self.halt_exits {
                std::process::exit(0);
            }
            return Err(ScrError::Halted(reason));
        }

        Ok(need_halt)
    }

    /// Synchronously flush the current dataset when it still needs it.
    fn flush_current_sync(&mut self) -> Result<(), ScrError> {
        if self.params.flush == 0 || self.dataset_id == 0 {
            return Ok(());
        }
        if !flushfile::need_flush(&self.flush_file, self.dataset_id, self.topo.local())? {
            return Ok(());
        }
        let info = self.dataset_info(self.dataset_id);
        let fctx = self.flush_ctx();
        flush::sync::flush_sync(&fctx, &self.map, self.dataset_id, &info)?;
        Ok(())
    }

    /// Start or run a flush when the cadence says so.
    fn check_flush(&mut self) -> Result<(), ScrError> {
        if self.params.flush == 0
            || self.dataset_id == 0
            || self.dataset_id % self.params.flush != 0
        {
            return Ok(());
        }
        if !flushfile::need_flush(&self.flush_file, self.dataset_id, self.topo.local())? {
            return Ok(());
        }

        if self.params.flush_async {
            // only one async flush at a time; drain the previous one
            if let Some(state) = self.async_flush.take() {
                let info = self.dataset_info(state.dataset);
                let fctx = self.flush_ctx();
                flush::nonblocking::wait(&fctx, &self.map, &state, &info)?;
            }
            let fctx = self.flush_ctx();
            let state = flush::nonblocking::start(&fctx, &self.map, self.dataset_id)?;
            self.async_flush = Some(state);
        } else {
            self.flush_current_sync()?;
        }
        Ok(())
    }

    /// Decides whether the application should take a checkpoint now.
    pub fn need_checkpoint(&mut self) -> Result<bool, ScrError> {
        self.need_count += 1;

        // a pending halt always wants one final checkpoint
        if self.check_halt(false, 0)? {
            return Ok(true);
        }

        let world = self.topo.world();
        let mut flag = vec![0u8];
        if world.rank() == 0 {
            let interval = self.params.checkpoint_interval;
            let seconds = self.params.checkpoint_seconds;
            let overhead = self.params.checkpoint_overhead;
            let mut need = false;

            if interval > 0 && self.need_count % interval == 0 {
                need = true;
            }
            if !need && seconds > 0 {
                let since = self.time_ckpt_end.elapsed().as_secs();
                if since >= seconds {
                    need = true;
                }
            }
            if !need && overhead > 0.0 {
                if self.ckpt_count == 0 {
                    // no cost estimate yet; take one to get it
                    need = true;
                } else {
                    let avg = self.ckpt_cost_total / self.ckpt_count as f64;
                    let since = self.time_ckpt_end.elapsed().as_secs_f64();
                    let percent = avg / (since + avg) * 100.0;
                    if percent < overhead {
                        need = true;
                    }
                }
            }
            if !need && interval == 0 && seconds == 0 && overhead <= 0.0 {
                need = true;
            }
            flag[0] = u8::from(need);
        }
        world.bcast(0, &mut flag)?;
        Ok(flag.first() == Some(&1))
    }

    /// Opens a new dataset: allocate the next id, make room in cache,
    /// and create its directory.
    pub fn start_checkpoint(&mut self) -> Result<(), ScrError> {
        if self.in_checkpoint {
            return Err(ScrError::InvalidCall(
                "complete_checkpoint must be called before start_checkpoint again".into(),
            ));
        }

        self.topo.world().barrier()?;
        self.in_checkpoint = true;
        self.dataset_id += 1;
        self.time_ckpt_start = Instant::now();

        let id = self.dataset_id;
        let desc_idx = {
            let picked = redundancy::select_for_dataset(&self.descriptors, id).ok_or_else(|| {
                ScrError::ConfigInvalid(format!("no descriptor covers dataset {id}"))
            })?;
            self.descriptors
                .iter()
                .position(|d| std::ptr::eq(d, picked))
                .expect("picked descriptor is in the table")
        };

        // make room under this descriptor's base
        loop {
            let base = self.descriptors[desc_idx].base.clone();
            let blocked = {
                let topo = &self.topo;
                let flush_file = &self.flush_file;
                let mut cctx = CacheCtx {
                    topo,
                    map: &mut self.map,
                    map_file: &self.map_file,
                    master_map_file: &self.master_map_file,
                    cntl_dir: &self.cntl_dir,
                    flush_file,
                    buf_size: self.params.mpi_buf_size,
                    crc_on_delete: self.params.crc_on_delete,
                    crc_on_copy: self.params.crc_on_copy,
                    diag: &self.diag,
                };
                cache::evict(&mut cctx, &base, self.params.cache_size, |dataset| {
                    Ok(flushfile::is_flushing(
                        flush_file,
                        dataset,
                        topo.local(),
                        topo.world(),
                    )?)
                })?
            };
            match blocked {
                None => break,
                Some(flushing_id) => {
                    // the only deletable dataset is mid-flush; wait it out
                    if let Some(state) = self.async_flush.take() {
                        let info = self.dataset_info(state.dataset);
                        let fctx = self.flush_ctx();
                        flush::nonblocking::wait(&fctx, &self.map, &state, &info)?;
                    } else {
                        // a foreign flusher owns it; poll until released
                        self.diag.dbg(
                            1,
                            format!("waiting for flush of dataset {flushing_id}"),
                        );
                        std::thread::sleep(self.poll_interval);
                    }
                }
            }
        }

        let desc_tree = self.descriptors[desc_idx].to_tree();
        self.map
            .set_desc(id, self.topo.rank_world(), desc_tree);
        self.map.write(&self.map_file)?;

        {
            let desc = &self.descriptors[desc_idx];
            let cctx = CacheCtx {
                topo: &self.topo,
                map: &mut self.map,
                map_file: &self.map_file,
                master_map_file: &self.master_map_file,
                cntl_dir: &self.cntl_dir,
                flush_file: &self.flush_file,
                buf_size: self.params.mpi_buf_size,
                crc_on_delete: self.params.crc_on_delete,
                crc_on_copy: self.params.crc_on_copy,
                diag: &self.diag,
            };
            cache::dataset_dir_create(&cctx, desc, id)?;
        }

        self.diag.dbg(1, format!("starting checkpoint {id}"));
        Ok(())
    }

    /// Maps a user-visible file name to its in-cache path and records it
    /// in the filemap.
    pub fn route_file(&mut self, file: &str) -> Result<PathBuf, ScrError> {
        if file.is_empty() {
            return Err(ScrError::InvalidCall("route_file of empty name".into()));
        }
        let id = self.dataset_id;
        let desc = redundancy::select_for_dataset(&self.descriptors, id).ok_or_else(|| {
            ScrError::ConfigInvalid(format!("no descriptor covers dataset {id}"))
        })?;
        let name = Path::new(file)
            .file_name()
            .ok_or_else(|| ScrError::InvalidCall(format!("'{file}' has no basename")))?;
        let routed = desc.dataset_dir(id).join(name);

        if self.in_checkpoint {
            self.map.add_file(id, self.topo.rank_world(), &routed);
            self.map.write(&self.map_file)?;
        } else if !routed.exists() {
            // restart read path: the file must already be in cache
            return Err(ScrError::InvalidCall(format!(
                "'{file}' is not present in cache"
            )));
        }
        Ok(routed)
    }

    /// Closes the dataset: write meta for every routed file, apply the
    /// redundancy scheme, then flush or halt as policy dictates.
    pub fn complete_checkpoint(&mut self, valid: bool) -> Result<(), ScrError> {
        if !self.in_checkpoint {
            return Err(ScrError::InvalidCall(
                "start_checkpoint must be called before complete_checkpoint".into(),
            ));
        }
        let id = self.dataset_id;
        let me = self.topo.rank_world();
        let n = self.topo.ranks_world();

        // a rank that failed to produce a routed file must still reach
        // the collective encode so the failure is agreed on, not hung on
        for file in self.map.files(id, me) {
            match FileMeta::for_file(&file, me, n, id, FileKind::Full, valid) {
                Ok(meta_rec) => meta::complete(&file, &meta_rec)?,
                Err(err) => {
                    self.diag
                        .err(format!("no data for routed file {}: {err}", file.display()));
                    meta::incomplete(&file);
                }
            }
        }

        // the dataset is in cache from here on, whatever the encode says;
        // a failed encode deletes it again, entry included
        flushfile::location_set(&self.flush_file, id, Location::Cache, self.topo.local())?;

        let desc = redundancy::select_for_dataset(&self.descriptors, id).ok_or_else(|| {
            ScrError::ConfigInvalid(format!("no descriptor covers dataset {id}"))
        })?;
        let encode = {
            let mut codec = CodecCtx {
                world: self.topo.world(),
                map: &mut self.map,
                map_file: &self.map_file,
                buf_size: self.params.mpi_buf_size,
                crc_on_copy: self.params.crc_on_copy,
                diag: &self.diag,
            };
            redundancy::apply(&mut codec, desc, id)
        };

        let cost = self.time_ckpt_start.elapsed().as_secs_f64();
        self.time_ckpt_end = Instant::now();
        self.ckpt_cost_total += cost;
        self.ckpt_count += 1;

        let result = match encode {
            Ok(bytes) => {
                self.diag.dbg(
                    1,
                    format!("completed checkpoint {id} ({bytes} bytes protected)"),
                );
                // the halt check may flush synchronously and exit, so it
                // runs before any new async flush starts
                self.check_halt(true, 1)?;
                self.check_flush()?;
                Ok(())
            }
            Err(err) => {
                self.diag.err(format!("checkpoint {id} failed: {err}"));
                let mut cctx = self.cache_ctx_owned();
                cache::delete_dataset(&mut cctx, id)?;
                Err(err.into())
            }
        };

        // opportunistically finish a drained async flush
        if let Some(state) = self.async_flush.take() {
            let fctx = self.flush_ctx();
            let (done, bytes) = flush::nonblocking::test(&fctx, &state)?;
            if done {
                let info = self.dataset_info(state.dataset);
                flush::nonblocking::complete(&fctx, &self.map, &state, &info)?;
            } else {
                if self.topo.rank_world() == 0 && state.bytes_total > 0 {
                    self.diag.dbg(
                        1,
                        format!(
                            "flush of dataset {} is {}% complete",
                            state.dataset,
                            bytes * 100 / state.bytes_total
                        ),
                    );
                }
                self.async_flush = Some(state);
            }
        }

        self.topo.world().barrier()?;
        self.in_checkpoint = false;
        result
    }

    /// Shuts the library down: resolve any async flush, flush the final
    /// dataset if needed, and mark the halt file so the job is not
    /// restarted.
    pub fn finalize(mut self) -> Result<(), ScrError> {
        if self.topo.rank_world() == 0 {
            self.halt.set_reason("SCR_FINALIZE_CALLED");
            self.halt.sync_and_decrement(&self.halt_file, 0)?;
        }

        if let Some(state) = self.async_flush.take() {
            let fctx = self.flush_ctx();
            if state.dataset == self.dataset_id {
                // the same dataset gets a sync flush below; cancel the
                // async one cleanly
                flush::nonblocking::stop(&fctx, &state)?;
            } else {
                let info = self.dataset_info(state.dataset);
                flush::nonblocking::wait(&fctx, &self.map, &state, &info)?;
            }
        }

        self.flush_current_sync()?;
        Ok(())
    }
}

fn descriptor_configs(
    params: &Params,
    username: &str,
    jobid: &str,
) -> Result<Vec<DescriptorConfig>, ScrError> {
    let directory = |base: &Path, index: usize| {
        base.join(username)
            .join(format!("scr.{jobid}"))
            .join(format!("index.{index}"))
    };

    if params.ckpt_entries.is_empty() {
        let base = params.cache_base.clone();
        return Ok(vec![DescriptorConfig {
            enabled: true,
            index: 0,
            interval: 1,
            directory: directory(&base, 0),
            base,
            scheme: params.copy_type,
            hop_distance: params.hop_distance,
            set_size: params.set_size,
        }]);
    }

    let mut configs = Vec::new();
    for key in params.ckpt_entries.int_keys() {
        let entry = params.ckpt_entries.get_int(key).expect("listed key");
        let index = key as usize;
        let base = entry
            .get_str("BASE")
            .map_or_else(|| params.cache_base.clone(), PathBuf::from);
        let scheme = match entry.get_str("TYPE") {
            Some(value) => Scheme::parse(value).ok_or_else(|| {
                ScrError::ConfigInvalid(format!("unknown TYPE '{value}' in CKPT={index}"))
            })?,
            None => params.copy_type,
        };
        configs.push(DescriptorConfig {
            enabled: entry.get_u64("ENABLED").is_none_or(|v| v != 0),
            index,
            interval: entry.get_u64("INTERVAL").unwrap_or(1),
            directory: entry
                .get_str("DIRECTORY")
                .map_or_else(|| directory(&base, index), PathBuf::from),
            base,
            scheme,
            hop_distance: entry
                .get_u64("HOP_DISTANCE")
                .unwrap_or(params.hop_distance as u64) as usize,
            set_size: entry.get_u64("SET_SIZE").unwrap_or(params.set_size as u64) as usize,
        });
    }
    Ok(configs)
}
