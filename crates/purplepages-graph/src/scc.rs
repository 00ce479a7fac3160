use purplepages_core::Pubkey;

use crate::FollowGraph;

/// Strongly connected components via iterative Tarjan.
///
/// The explicit work stack (node, next-child position) replaces recursion so
/// pathological follow chains can't overflow the thread stack.
pub fn tarjan(graph: &FollowGraph) -> Vec<Vec<Pubkey>> {
    let n = graph.node_count();
    let adjacency = graph.adjacency();

    const UNVISITED: usize = usize::MAX;
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut sccs: Vec<Vec<Pubkey>> = Vec::new();

    let mut work: Vec<(usize, usize)> = Vec::new();
    for start in 0..n {
        if index[start] != UNVISITED {
            continue;
        }
        work.push((start, 0));

        while let Some((node, child_pos)) = work.pop() {
            if child_pos == 0 {
                index[node] = next_index;
                lowlink[node] = next_index;
                next_index += 1;
                stack.push(node);
                on_stack[node] = true;
            }

            let mut recursed = false;
            for (pos, next) in adjacency[node].iter().enumerate().skip(child_pos) {
                let next = *next;
                if index[next] == UNVISITED {
                    work.push((node, pos + 1));
                    work.push((next, 0));
                    recursed = true;
                    break;
                }
                if on_stack[next] {
                    lowlink[node] = lowlink[node].min(index[next]);
                }
            }
            if recursed {
                continue;
            }

            if lowlink[node] == index[node] {
                let mut scc = Vec::new();
                loop {
                    let member = stack.pop().expect("Can't fail: node is on the stack");
                    on_stack[member] = false;
                    scc.push(graph.nodes()[member]);
                    if member == node {
                        break;
                    }
                }
                sccs.push(scc);
            }

            if let Some((parent, _)) = work.last() {
                lowlink[*parent] = lowlink[*parent].min(lowlink[node]);
            }
        }
    }

    sccs
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    fn scc_sets(graph: &FollowGraph) -> HashSet<Vec<Pubkey>> {
        tarjan(graph)
            .into_iter()
            .map(|mut scc| {
                scc.sort();
                scc
            })
            .collect()
    }

    #[test]
    fn singleton_components_without_cycles() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2)]);
        graph.add_contact_list(pk(2), [pk(3)]);
        let sccs = scc_sets(&graph);
        assert_eq!(sccs.len(), 3);
        assert!(sccs.iter().all(|scc| scc.len() == 1));
    }

    #[test]
    fn mutual_follow_pair_is_one_component() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2)]);
        graph.add_contact_list(pk(2), [pk(1)]);
        let sccs = scc_sets(&graph);
        assert!(sccs.contains(&vec![pk(1), pk(2)]));
    }

    #[test]
    fn ring_plus_tail() {
        let mut graph = FollowGraph::new();
        // 1 -> 2 -> 3 -> 1 ring, with 3 -> 4 tail
        graph.add_contact_list(pk(1), [pk(2)]);
        graph.add_contact_list(pk(2), [pk(3)]);
        graph.add_contact_list(pk(3), [pk(1), pk(4)]);
        let sccs = scc_sets(&graph);
        assert!(sccs.contains(&vec![pk(1), pk(2), pk(3)]));
        assert!(sccs.contains(&vec![pk(4)]));
        assert_eq!(sccs.len(), 2);
    }

    #[test]
    fn two_separate_cycles() {
        let mut graph = FollowGraph::new();
        graph.add_contact_list(pk(1), [pk(2)]);
        graph.add_contact_list(pk(2), [pk(1)]);
        graph.add_contact_list(pk(5), [pk(6)]);
        graph.add_contact_list(pk(6), [pk(7)]);
        graph.add_contact_list(pk(7), [pk(5)]);
        let sccs = scc_sets(&graph);
        assert!(sccs.contains(&vec![pk(1), pk(2)]));
        assert!(sccs.contains(&vec![pk(5), pk(6), pk(7)]));
    }

    #[test]
    fn deep_chain_does_not_overflow() {
        let mut graph = FollowGraph::new();
        // a long cycle exercises the explicit stack
        let key = |n: u32| {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&n.to_be_bytes());
            Pubkey::from_bytes(bytes)
        };
        const LEN: u32 = 50_000;
        for n in 0..LEN {
            graph.add_contact_list(key(n), [key((n + 1) % LEN)]);
        }
        let sccs = tarjan(&graph);
        assert_eq!(sccs.len(), 1);
        assert_eq!(sccs[0].len(), LEN as usize);
    }
}
