//! Pure graph analysis over the follow graph.
//!
//! Everything here is deterministic and I/O-free: the analyzer task builds
//! one [`FollowGraph`] snapshot per cycle and passes it to each step, so all
//! steps observe the same graph.

mod clusters;
mod community;
mod follow_graph;
mod scc;
mod trust;

pub use clusters::{detect_bot_clusters, BotCluster};
pub use community::{detect_communities, Community, CommunityGraph};
pub use follow_graph::FollowGraph;
pub use scc::tarjan;
pub use trust::propagate_trust;
