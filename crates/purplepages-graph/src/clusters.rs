use std::collections::HashMap;

use purplepages_core::Pubkey;

use crate::FollowGraph;

/// Internal edge density above which an SCC qualifies as a bot cluster.
pub const DENSITY_THRESHOLD: f64 = 0.70;
/// External edge ratio below which an SCC qualifies as a bot cluster.
pub const EXTERNAL_RATIO_THRESHOLD: f64 = 0.20;

/// A strongly connected component dense enough inside and isolated enough
/// outside to look like a coordinated bot ring.
#[derive(Debug, Clone, PartialEq)]
pub struct BotCluster {
    pub members: Vec<Pubkey>,
    pub internal_edges: u64,
    pub external_edges: u64,
    /// `internal_edges / (n * (n - 1))`.
    pub internal_density: f64,
    /// `external_edges / (internal_edges + external_edges)`.
    pub external_ratio: f64,
}

/// Score every SCC with at least `min_size` members against the density
/// thresholds.
///
/// An edge is internal to a cluster when both endpoints are members;
/// any edge with exactly one endpoint inside counts as external, in either
/// direction.
pub fn detect_bot_clusters(
    graph: &FollowGraph,
    sccs: &[Vec<Pubkey>],
    min_size: usize,
) -> Vec<BotCluster> {
    // component id per node; nodes in small SCCs share the "no cluster" id
    const NO_CLUSTER: usize = usize::MAX;
    let mut cluster_of: HashMap<Pubkey, usize> = HashMap::new();
    let mut candidates: Vec<&Vec<Pubkey>> = Vec::new();
    for scc in sccs {
        if scc.len() < min_size.max(2) {
            continue;
        }
        let cluster_id = candidates.len();
        candidates.push(scc);
        for member in scc {
            cluster_of.insert(*member, cluster_id);
        }
    }
    if candidates.is_empty() {
        return vec![];
    }

    let mut internal = vec![0u64; candidates.len()];
    let mut external = vec![0u64; candidates.len()];
    for (follower, followed) in graph.edges() {
        let from = cluster_of.get(&follower).copied().unwrap_or(NO_CLUSTER);
        let to = cluster_of.get(&followed).copied().unwrap_or(NO_CLUSTER);
        if from == to {
            if from != NO_CLUSTER {
                internal[from] += 1;
            }
            continue;
        }
        if from != NO_CLUSTER {
            external[from] += 1;
        }
        if to != NO_CLUSTER {
            external[to] += 1;
        }
    }

    let mut clusters = Vec::new();
    for (cluster_id, members) in candidates.iter().enumerate() {
        let n = members.len() as u64;
        let internal_edges = internal[cluster_id];
        let external_edges = external[cluster_id];

        let internal_density = internal_edges as f64 / (n * (n - 1)) as f64;
        let total = internal_edges + external_edges;
        let external_ratio = if total == 0 {
            0.0
        } else {
            external_edges as f64 / total as f64
        };

        if DENSITY_THRESHOLD < internal_density && external_ratio < EXTERNAL_RATIO_THRESHOLD {
            let mut members = (*members).clone();
            members.sort();
            clusters.push(BotCluster {
                members,
                internal_edges,
                external_edges,
                internal_density,
                external_ratio,
            });
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarjan;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    /// Everyone follows everyone inside the set.
    fn add_clique(graph: &mut FollowGraph, members: &[Pubkey]) {
        for member in members {
            graph.add_contact_list(
                *member,
                members.iter().copied().filter(|other| other != member),
            );
        }
    }

    #[test]
    fn isolated_clique_is_a_cluster() {
        let mut graph = FollowGraph::new();
        add_clique(&mut graph, &[pk(1), pk(2), pk(3), pk(4)]);

        let sccs = tarjan(&graph);
        let clusters = detect_bot_clusters(&graph, &sccs, 3);
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.members, vec![pk(1), pk(2), pk(3), pk(4)]);
        assert_eq!(cluster.internal_edges, 12);
        assert_eq!(cluster.external_edges, 0);
        assert_eq!(cluster.internal_density, 1.0);
        assert_eq!(cluster.external_ratio, 0.0);
    }

    #[test]
    fn well_connected_clique_is_not_a_cluster() {
        let mut graph = FollowGraph::new();
        add_clique(&mut graph, &[pk(1), pk(2), pk(3)]);
        // heavy outside traffic pushes the external ratio over the line
        for outsider in 10..15u8 {
            graph.add_contact_list(pk(outsider), [pk(1), pk(2), pk(3)]);
        }

        let sccs = tarjan(&graph);
        let clusters = detect_bot_clusters(&graph, &sccs, 3);
        assert!(clusters.is_empty());
    }

    #[test]
    fn sparse_cycle_fails_density() {
        let mut graph = FollowGraph::new();
        // a plain 5-ring: density 5/20 = 0.25
        let ring = [pk(1), pk(2), pk(3), pk(4), pk(5)];
        for i in 0..ring.len() {
            graph.add_contact_list(ring[i], [ring[(i + 1) % ring.len()]]);
        }

        let sccs = tarjan(&graph);
        let clusters = detect_bot_clusters(&graph, &sccs, 3);
        assert!(clusters.is_empty());
    }

    #[test]
    fn min_size_filters_small_components() {
        let mut graph = FollowGraph::new();
        add_clique(&mut graph, &[pk(1), pk(2)]);

        let sccs = tarjan(&graph);
        assert!(detect_bot_clusters(&graph, &sccs, 3).is_empty());
    }
}
