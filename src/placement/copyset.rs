use std::collections::BTreeSet;

use rand::Rng;
use rand::seq::SliceRandom;

/// Number of random permutations needed so each host lands in roughly
/// `scatter_width` distinct copysets: each permutation contributes
/// `rfactor - 1` new neighbors per host.
pub fn permutation_count(scatter_width: u32, rfactor: usize) -> usize {
    let per_permutation = rfactor.saturating_sub(1).max(1);
    ((scatter_width as usize).div_ceil(per_permutation)).max(1)
}

/// Generates candidate copysets of `rfactor` hosts.
///
/// Each permutation of the live hosts is sliced into consecutive groups of
/// `rfactor`; a group that reproduces an already-existing or already-emitted
/// member set is discarded, so equal-size copysets stay pairwise distinct
/// and correlated-failure blast radius stays bounded by the scatter width.
pub fn create_copysets<R: Rng>(
    rng: &mut R,
    live_hosts: &[u32],
    rfactor: usize,
    scatter_width: u32,
    existing: &BTreeSet<BTreeSet<u32>>,
) -> Vec<Vec<u32>> {
    let mut seen = existing.clone();
    let mut produced = Vec::new();
    if live_hosts.len() < rfactor || rfactor == 0 {
        return produced;
    }

    let mut pool = live_hosts.to_vec();
    for _ in 0..permutation_count(scatter_width, rfactor) {
        pool.shuffle(rng);
        for chunk in pool.chunks_exact(rfactor) {
            let members: BTreeSet<u32> = chunk.iter().copied().collect();
            if seen.contains(&members) {
                continue;
            }
            seen.insert(members);
            produced.push(chunk.to_vec());
        }
    }
    produced
}
