//! The relay's service layer: admission, dispatch, analysis and the
//! supervisor that wires every component together.

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod req_tracker;
pub mod supervisor;
pub mod task;
pub mod trusted_set;

use std::collections::BTreeSet;
use std::sync::Arc;

use purplepages_core::Kind;

pub use self::admission::{AdmissionGate, Rejected};
pub use self::config::Config;
pub use self::dispatcher::{ConnectionCtx, Dispatcher, PublishOutcome};
pub use self::req_tracker::RequestTracker;
pub use self::supervisor::{InitError, Services};
pub use self::trusted_set::TrustedSet;

/// The relay's kind whitelist, shared immutably across components.
pub type KindAllowlist = Arc<BTreeSet<Kind>>;
