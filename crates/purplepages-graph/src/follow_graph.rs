use std::collections::{HashMap, HashSet};

use purplepages_core::Pubkey;

/// Directed follow graph: an edge `follower -> followed` per contact-list
/// entry.
///
/// Nodes are interned into a stable index space (insertion order) so the
/// algorithms can work on dense arrays instead of chasing hash maps.
#[derive(Debug, Clone, Default)]
pub struct FollowGraph {
    nodes: Vec<Pubkey>,
    node_index: HashMap<Pubkey, usize>,
    /// Adjacency by node index; deduplicated.
    followees: Vec<Vec<usize>>,
    edge_count: u64,
}

impl FollowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, pubkey: Pubkey) -> usize {
        if let Some(index) = self.node_index.get(&pubkey) {
            return *index;
        }
        let index = self.nodes.len();
        self.nodes.push(pubkey);
        self.node_index.insert(pubkey, index);
        self.followees.push(Vec::new());
        index
    }

    /// Add one author's contact list. Self-follows and duplicate entries
    /// are dropped.
    pub fn add_contact_list(
        &mut self,
        follower: Pubkey,
        followees: impl IntoIterator<Item = Pubkey>,
    ) {
        let follower_index = self.intern(follower);
        let mut seen: HashSet<usize> =
            self.followees[follower_index].iter().copied().collect();
        for followed in followees {
            if followed == follower {
                continue;
            }
            let followed_index = self.intern(followed);
            if seen.insert(followed_index) {
                self.followees[follower_index].push(followed_index);
                self.edge_count += 1;
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count
    }

    pub fn nodes(&self) -> &[Pubkey] {
        &self.nodes
    }

    pub fn contains(&self, pubkey: Pubkey) -> bool {
        self.node_index.contains_key(&pubkey)
    }

    pub(crate) fn index_of(&self, pubkey: Pubkey) -> Option<usize> {
        self.node_index.get(&pubkey).copied()
    }

    pub(crate) fn adjacency(&self) -> &[Vec<usize>] {
        &self.followees
    }

    pub fn followees(&self, pubkey: Pubkey) -> impl Iterator<Item = Pubkey> + '_ {
        self.node_index
            .get(&pubkey)
            .into_iter()
            .flat_map(|index| self.followees[*index].iter())
            .map(|index| self.nodes[*index])
    }

    pub fn follows(&self, follower: Pubkey, followed: Pubkey) -> bool {
        let (Some(follower), Some(followed)) =
            (self.index_of(follower), self.index_of(followed))
        else {
            return false;
        };
        self.followees[follower].contains(&followed)
    }

    /// Follower count per node, by reverse aggregation.
    pub fn follower_counts(&self) -> HashMap<Pubkey, u64> {
        let mut counts: Vec<u64> = vec![0; self.nodes.len()];
        for followees in &self.followees {
            for followed in followees {
                counts[*followed] += 1;
            }
        }
        self.nodes
            .iter()
            .zip(counts)
            .filter(|(_, count)| 0 < *count)
            .map(|(pubkey, count)| (*pubkey, count))
            .collect()
    }

    /// Reverse adjacency: who follows each node, by index.
    pub(crate) fn followers_by_index(&self) -> Vec<Vec<usize>> {
        let mut followers: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (follower, followees) in self.followees.iter().enumerate() {
            for followed in followees {
                followers[*followed].push(follower);
            }
        }
        followers
    }

    /// All directed edges as `(follower, followed)` pairs.
    pub fn edges(&self) -> impl Iterator<Item = (Pubkey, Pubkey)> + '_ {
        self.followees
            .iter()
            .enumerate()
            .flat_map(move |(follower, followees)| {
                followees
                    .iter()
                    .map(move |followed| (self.nodes[follower], self.nodes[*followed]))
            })
    }

    /// Largest weakly connected component: BFS over the undirected view.
    pub fn largest_weakly_connected_component(&self) -> HashSet<Pubkey> {
        let n = self.nodes.len();
        if n == 0 {
            return HashSet::new();
        }

        let mut undirected: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (follower, followees) in self.followees.iter().enumerate() {
            for followed in followees {
                undirected[follower].push(*followed);
                undirected[*followed].push(follower);
            }
        }

        let mut visited = vec![false; n];
        let mut best: Vec<usize> = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        for start in 0..n {
            if visited[start] {
                continue;
            }
            let mut component = vec![start];
            visited[start] = true;
            queue.push_back(start);
            while let Some(node) = queue.pop_front() {
                for next in &undirected[node] {
                    if !visited[*next] {
                        visited[*next] = true;
                        component.push(*next);
                        queue.push_back(*next);
                    }
                }
            }
            if best.len() < component.len() {
                best = component;
            }
        }

        best.into_iter().map(|index| self.nodes[index]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    #[test]
    fn dedup_and_self_follow() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2), pk(2), pk(1), pk(3)]);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.follows(pk(1), pk(2)));
        assert!(!graph.follows(pk(1), pk(1)));
    }

    #[test]
    fn follower_counts_reverse_aggregate() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(3)]);
        graph.add_contact_list(pk(2), [pk(3), pk(1)]);
        let counts = graph.follower_counts();
        assert_eq!(counts[&pk(3)], 2);
        assert_eq!(counts[&pk(1)], 1);
        assert!(!counts.contains_key(&pk(2)));
    }

    #[test]
    fn largest_weak_component() {
        let mut graph = FollowGraph::new();
        // component {1,2,3} (direction ignored), component {4,5}
        graph.add_contact_list(pk(1), [pk(2)]);
        graph.add_contact_list(pk(3), [pk(2)]);
        graph.add_contact_list(pk(4), [pk(5)]);
        let component = graph.largest_weakly_connected_component();
        assert_eq!(component, [pk(1), pk(2), pk(3)].into());
    }

    #[test]
    fn incremental_contact_lists_merge() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2)]);
        graph.add_contact_list(pk(1), [pk(2), pk(3)]);
        assert_eq!(graph.edge_count(), 2);
        let followees: Vec<Pubkey> = graph.followees(pk(1)).collect();
        assert_eq!(followees, vec![pk(2), pk(3)]);
    }
}
