use std::collections::HashSet;

use purplepages_core::Pubkey;

use crate::FollowGraph;

/// Upper bound on propagation rounds; each round promotes at least one
/// pubkey or terminates, so this only guards degenerate inputs.
const MAX_ROUNDS: usize = 64;

/// Propagate trust from a seed set to a fixed point.
///
/// A pubkey becomes trusted once at least `threshold` of its followers are
/// trusted. Rounds are synchronous: promotions in round N only count toward
/// round N+1, which keeps the result independent of iteration order.
pub fn propagate_trust(
    graph: &FollowGraph,
    seed: &HashSet<Pubkey>,
    threshold: usize,
) -> HashSet<Pubkey> {
    let followers = graph.followers_by_index();
    let nodes = graph.nodes();

    let mut trusted: Vec<bool> = nodes.iter().map(|node| seed.contains(node)).collect();

    for _ in 0..MAX_ROUNDS {
        let mut promoted: Vec<usize> = Vec::new();
        for (node, node_followers) in followers.iter().enumerate() {
            if trusted[node] {
                continue;
            }
            let trusted_followers = node_followers
                .iter()
                .filter(|follower| trusted[**follower])
                .count();
            if threshold <= trusted_followers {
                promoted.push(node);
            }
        }
        if promoted.is_empty() {
            break;
        }
        for node in promoted {
            trusted[node] = true;
        }
    }

    let mut result: HashSet<Pubkey> = nodes
        .iter()
        .zip(&trusted)
        .filter(|(_, trusted)| **trusted)
        .map(|(node, _)| *node)
        .collect();

    // seed members that never posted a contact list are still trusted
    for pubkey in seed {
        result.insert(*pubkey);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    #[test]
    fn seed_component_stays_trusted() {
        // A->B, B->A, A->C, B->C, C->D, D->E; the whole graph is one weak
        // component, so seeding it trusts all five.
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2), pk(3)]);
        graph.add_contact_list(pk(2), [pk(1), pk(3)]);
        graph.add_contact_list(pk(3), [pk(4)]);
        graph.add_contact_list(pk(4), [pk(5)]);

        let seed = graph.largest_weakly_connected_component();
        assert_eq!(seed.len(), 5);

        let trusted = propagate_trust(&graph, &seed, 2);
        assert_eq!(trusted.len(), 5);
    }

    #[test]
    fn promotion_needs_threshold_followers() {
        let mut graph = FollowGraph::new();
        // trusted 1 and 2 both follow 4; only 3 follows 5
        graph.add_contact_list(pk(1), [pk(4)]);
        graph.add_contact_list(pk(2), [pk(4)]);
        graph.add_contact_list(pk(3), [pk(5)]);

        let seed: HashSet<Pubkey> = [pk(1), pk(2), pk(3)].into();
        let trusted = propagate_trust(&graph, &seed, 2);

        assert!(trusted.contains(&pk(4)));
        assert!(!trusted.contains(&pk(5)));
    }

    #[test]
    fn trust_chains_through_rounds() {
        let mut graph = FollowGraph::new();
        // 1,2 -> 3; once 3 is trusted, 2,3 -> 4 promotes 4 a round later
        graph.add_contact_list(pk(1), [pk(3)]);
        graph.add_contact_list(pk(2), [pk(3), pk(4)]);
        graph.add_contact_list(pk(3), [pk(4)]);

        let seed: HashSet<Pubkey> = [pk(1), pk(2)].into();
        let trusted = propagate_trust(&graph, &seed, 2);

        assert!(trusted.contains(&pk(3)));
        assert!(trusted.contains(&pk(4)));
    }

    #[test]
    fn empty_seed_trusts_nothing() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2)]);
        let trusted = propagate_trust(&graph, &HashSet::new(), 1);
        assert!(trusted.is_empty());
    }

    #[test]
    fn seed_outside_graph_survives() {
        let graph = FollowGraph::new();
        let seed: HashSet<Pubkey> = [pk(9)].into();
        let trusted = propagate_trust(&graph, &seed, 1);
        assert_eq!(trusted, seed);
    }
}
