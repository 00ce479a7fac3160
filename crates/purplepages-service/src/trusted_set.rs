use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use purplepages_core::Pubkey;
use purplepages_sync::TrustedWatch;
use tokio::sync::watch;

/// The live trusted set.
///
/// Replaced wholesale by the graph analyzer via pointer swap of an
/// immutable set; readers snapshot the `Arc` under a read lock and use the
/// snapshot without further synchronization, so no observer ever sees a
/// half-built set.
#[derive(Debug)]
pub struct TrustedSet {
    current: RwLock<Arc<HashSet<Pubkey>>>,
    watch_tx: watch::Sender<Arc<HashSet<Pubkey>>>,
}

impl TrustedSet {
    pub fn new(initial: HashSet<Pubkey>) -> Self {
        let initial = Arc::new(initial);
        let (watch_tx, _) = watch::channel(initial.clone());
        Self {
            current: RwLock::new(initial),
            watch_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<HashSet<Pubkey>> {
        self.current.read().expect("Locking failed").clone()
    }

    pub fn replace(&self, next: HashSet<Pubkey>) {
        let next = Arc::new(next);
        *self.current.write().expect("Locking failed") = next.clone();
        let _ = self.watch_tx.send(next);
    }

    pub fn contains(&self, pubkey: Pubkey) -> bool {
        self.snapshot().contains(&pubkey)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Watch side for the trusted syncer.
    pub fn subscribe(&self) -> TrustedWatch {
        self.watch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> Pubkey {
        Pubkey::from_bytes([n; 32])
    }

    #[test]
    fn snapshots_are_immutable_across_replace() {
        let set = TrustedSet::new([pk(1)].into());
        let before = set.snapshot();

        set.replace([pk(2), pk(3)].into());

        assert!(before.contains(&pk(1)));
        assert_eq!(before.len(), 1);
        assert_eq!(set.len(), 2);
        assert!(set.contains(pk(2)));
        assert!(!set.contains(pk(1)));
    }

    #[test]
    fn watch_observes_replacement() {
        let set = TrustedSet::new(HashSet::new());
        let watch_rx = set.subscribe();
        set.replace([pk(7)].into());
        assert!(watch_rx.borrow().contains(&pk(7)));
    }
}
