use std::collections::HashMap;

use purplepages_core::Pubkey;

use crate::FollowGraph;

/// Local-moving passes before the partition is declared stable.
const MAX_PASSES: usize = 10;
/// How many members a community reports as representatives.
const TOP_MEMBERS: usize = 5;

/// One detected community.
#[derive(Debug, Clone)]
pub struct Community {
    pub id: i64,
    pub members: Vec<Pubkey>,
    /// Directed follow edges with both endpoints inside.
    pub internal_edges: u64,
    /// Directed follow edges with exactly one endpoint inside.
    pub external_edges: u64,
    /// This community's contribution to the partition modularity.
    pub modularity: f64,
    /// Most-followed members, for display.
    pub top_members: Vec<Pubkey>,
}

/// The community partition plus weighted inter-community edges.
#[derive(Debug, Clone, Default)]
pub struct CommunityGraph {
    pub communities: Vec<Community>,
    /// `(from_id, to_id, directed edge count)`.
    pub edges: Vec<(i64, i64, u64)>,
}

/// Modularity-based community detection (Louvain local-moving phase).
///
/// Works on the undirected projection of the follow graph: a mutual follow
/// weighs twice a one-way follow. Nodes greedily move to the neighboring
/// community with the best modularity gain until a pass makes no move.
/// Communities smaller than `min_size` are dropped from the output.
pub fn detect_communities(graph: &FollowGraph, min_size: usize) -> CommunityGraph {
    let n = graph.node_count();
    if n == 0 {
        return CommunityGraph::default();
    }

    // undirected projection
    let mut weights: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n];
    for (follower, followees) in graph.adjacency().iter().enumerate() {
        for followed in followees {
            *weights[follower].entry(*followed).or_default() += 1.0;
            *weights[*followed].entry(follower).or_default() += 1.0;
        }
    }

    let degree: Vec<f64> = weights
        .iter()
        .map(|neighbors| neighbors.values().sum())
        .collect();
    let m2: f64 = degree.iter().sum();
    if m2 == 0.0 {
        return CommunityGraph::default();
    }

    let mut community: Vec<usize> = (0..n).collect();
    let mut community_degree: Vec<f64> = degree.clone();

    let mut pass = 0;
    let mut improved = true;
    while improved && pass < MAX_PASSES {
        improved = false;
        pass += 1;
        for node in 0..n {
            let current = community[node];

            let mut links: HashMap<usize, f64> = HashMap::new();
            for (neighbor, weight) in &weights[node] {
                *links.entry(community[*neighbor]).or_default() += weight;
            }

            community_degree[current] -= degree[node];

            let mut best = current;
            let mut best_gain = links.get(&current).copied().unwrap_or(0.0)
                - community_degree[current] * degree[node] / m2;
            for (candidate, weight) in &links {
                if *candidate == current {
                    continue;
                }
                let gain = weight - community_degree[*candidate] * degree[node] / m2;
                if best_gain < gain {
                    best_gain = gain;
                    best = *candidate;
                }
            }

            community_degree[best] += degree[node];
            if best != current {
                community[node] = best;
                improved = true;
            }
        }
    }

    // gather members per surviving label
    let mut members_of: HashMap<usize, Vec<usize>> = HashMap::new();
    for (node, label) in community.iter().enumerate() {
        members_of.entry(*label).or_default().push(node);
    }

    let mut labels: Vec<(usize, Vec<usize>)> = members_of
        .into_iter()
        .filter(|(_, members)| min_size.max(1) <= members.len())
        .collect();
    // biggest first; labels tie-break keeps the output deterministic
    labels.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    let output_id: HashMap<usize, i64> = labels
        .iter()
        .enumerate()
        .map(|(id, (label, _))| (*label, id as i64))
        .collect();

    // directed internal/external counts and inter-community edges
    let mut internal: Vec<u64> = vec![0; labels.len()];
    let mut external: Vec<u64> = vec![0; labels.len()];
    let mut between: HashMap<(i64, i64), u64> = HashMap::new();
    for (follower, followees) in graph.adjacency().iter().enumerate() {
        for followed in followees {
            let from = output_id.get(&community[follower]).copied();
            let to = output_id.get(&community[*followed]).copied();
            match (from, to) {
                (Some(from), Some(to)) if from == to => {
                    internal[from as usize] += 1;
                }
                (from, to) => {
                    if let Some(from) = from {
                        external[from as usize] += 1;
                    }
                    if let Some(to) = to {
                        external[to as usize] += 1;
                    }
                    if let (Some(from), Some(to)) = (from, to) {
                        *between.entry((from, to)).or_default() += 1;
                    }
                }
            }
        }
    }

    let follower_counts = graph.follower_counts();
    let nodes = graph.nodes();

    let communities = labels
        .iter()
        .enumerate()
        .map(|(id, (_, member_indices))| {
            // undirected internal weight; every inside pair counted twice
            let mut internal_weight = 0.0;
            let mut total_degree = 0.0;
            for member in member_indices {
                total_degree += degree[*member];
                for (neighbor, weight) in &weights[*member] {
                    if community[*neighbor] == community[*member] {
                        internal_weight += weight;
                    }
                }
            }
            let internal_weight = internal_weight / 2.0;
            let m = m2 / 2.0;
            let modularity = internal_weight / m - (total_degree / m2).powi(2);

            let mut members: Vec<Pubkey> =
                member_indices.iter().map(|index| nodes[*index]).collect();
            members.sort();

            let mut top_members = members.clone();
            top_members.sort_by(|a, b| {
                let fa = follower_counts.get(a).copied().unwrap_or(0);
                let fb = follower_counts.get(b).copied().unwrap_or(0);
                fb.cmp(&fa).then(a.cmp(b))
            });
            top_members.truncate(TOP_MEMBERS);

            Community {
                id: id as i64,
                members,
                internal_edges: internal[id],
                external_edges: external[id],
                modularity,
                top_members,
            }
        })
        .collect();

    let mut edges: Vec<(i64, i64, u64)> = between
        .into_iter()
        .map(|((from, to), weight)| (from, to, weight))
        .collect();
    edges.sort();

    CommunityGraph { communities, edges }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    fn add_clique(graph: &mut FollowGraph, members: &[Pubkey]) {
        for member in members {
            graph.add_contact_list(
                *member,
                members.iter().copied().filter(|other| other != member),
            );
        }
    }

    #[test]
    fn two_cliques_with_a_bridge() {
        let mut graph = FollowGraph::new();
        let left = [pk(1), pk(2), pk(3), pk(4)];
        let right = [pk(11), pk(12), pk(13), pk(14)];
        add_clique(&mut graph, &left);
        add_clique(&mut graph, &right);
        graph.add_contact_list(pk(4), [pk(11)]);

        let result = detect_communities(&graph, 2);
        assert_eq!(result.communities.len(), 2);
        for community in &result.communities {
            assert_eq!(community.members.len(), 4);
            assert_eq!(community.internal_edges, 12);
            assert!(0.0 < community.modularity);
        }
        // the bridge shows up as one directed inter-community edge
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].2, 1);
        let external: Vec<u64> = result
            .communities
            .iter()
            .map(|community| community.external_edges)
            .collect();
        assert_eq!(external, vec![1, 1]);
    }

    #[test]
    fn min_size_drops_stragglers() {
        let mut graph = FollowGraph::new();
        add_clique(&mut graph, &[pk(1), pk(2), pk(3)]);
        graph.add_contact_list(pk(9), [pk(1)]);

        let result = detect_communities(&graph, 3);
        assert_eq!(result.communities.len(), 1);
        assert_eq!(result.communities[0].members, vec![pk(1), pk(2), pk(3)]);
    }

    #[test]
    fn empty_graph_has_no_communities() {
        let graph = FollowGraph::new();
        let result = detect_communities(&graph, 2);
        assert!(result.communities.is_empty());
        assert!(result.edges.is_empty());
    }

    #[test]
    fn top_members_ranked_by_followers() {
        let mut graph = FollowGraph::new();
        add_clique(&mut graph, &[pk(1), pk(2), pk(3), pk(4)]);
        // extra followers make pk(3) the clear representative
        for outsider in 20..23u8 {
            graph.add_contact_list(pk(outsider), [pk(3)]);
        }

        let result = detect_communities(&graph, 4);
        let main = result
            .communities
            .iter()
            .find(|community| community.members.contains(&pk(3)))
            .expect("clique community exists");
        assert_eq!(main.top_members[0], pk(3));
    }
}
