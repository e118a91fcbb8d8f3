//! Filemap gather/scatter: on restart, the node master collects every
//! per-rank filemap left in the control directory, hands each local rank
//! its own entries, and round-robins entries for ranks that no longer
//! run on this node. The design tolerates any change in ranks-per-node
//! between runs.

use std::path::Path;

use filemap::Filemap;
use group::Communicator;
use kvtree::KvTree;

use crate::{CacheCtx, CacheError};

const KEY_FILEMAP: &str = "Filemap";

/// Runs the gather/scatter. Afterwards every local rank's in-memory map
/// holds its share and its on-disk filemap is rewritten.
pub fn gather_scatter(ctx: &mut CacheCtx<'_>) -> Result<(), CacheError> {
    let local = ctx.topo.local();
    let ranks_local = local.size();

    if local.rank() == 0 {
        // fold every filemap the previous run left behind into one
        let mut all = Filemap::new();
        if let Some(master) = KvTree::read_file_if_exists(ctx.master_map_file)? {
            if let Some(listed) = master.get(KEY_FILEMAP) {
                for file in listed.keys() {
                    let path = Path::new(file);
                    all.merge(Filemap::read(path)?);
                    let _ = std::fs::remove_file(path);
                }
            }
        }

        // each local rank gets its own entries first
        let world_ranks = local.member_world_ranks();
        let mut bundles: Vec<Filemap> = (0..ranks_local).map(|_| Filemap::new()).collect();
        for (i, &world_rank) in world_ranks.iter().enumerate() {
            bundles[i].merge(all.extract_rank(world_rank));
        }

        // remaining entries belong to ranks now living elsewhere (or
        // nowhere); spread them for load balance
        for (j, orphan) in all.all_ranks().into_iter().enumerate() {
            bundles[j % ranks_local].merge(all.extract_rank(orphan));
        }

        for (i, bundle) in bundles.iter().enumerate().skip(1) {
            kvtree::exchange::send(bundle.as_tree(), i, local)?;
        }
        let mine = std::mem::take(&mut bundles[0]);
        ctx.map.merge(mine);

        // refresh the master listing for the next restart
        let mut master = KvTree::new();
        for i in 0..ranks_local {
            master.set_kv(
                KEY_FILEMAP,
                ctx.rank_map_file(i).to_string_lossy().into_owned(),
            );
        }
        master.write_file(ctx.master_map_file)?;
    } else {
        let tree = kvtree::exchange::recv(0, local)?;
        ctx.map.merge(Filemap::from_tree(tree));
    }

    ctx.persist_map()?;
    Ok(())
}
