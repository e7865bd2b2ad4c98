// crates/cutline-core/src/cancel.rs
//
// Cooperative cancellation token, scoped to a clip + scrub epoch so that a
// stale wakeup cancelling an already-superseded task is an idempotent no-op.
// Checked at every suspension point: between decode attempts, between sample
// reads, and before cache writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CancelToken {
    flag:  Arc<AtomicBool>,
    epoch: u64,
}

impl CancelToken {
    pub fn new(epoch: u64) -> Self {
        CancelToken { flag: Arc::new(AtomicBool::new(false)), epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Cancel only if the token still belongs to `epoch`. Returns whether the
    /// cancel applied.
    pub fn cancel_if_epoch(&self, epoch: u64) -> bool {
        if self.epoch == epoch {
            self.cancel();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_epoch_cancel_is_a_no_op() {
        let t = CancelToken::new(7);
        assert!(!t.cancel_if_epoch(6));
        assert!(!t.is_cancelled());
        assert!(t.cancel_if_epoch(7));
        assert!(t.is_cancelled());
    }

    #[test]
    fn clones_share_the_flag() {
        let t = CancelToken::new(1);
        let c = t.clone();
        t.cancel();
        assert!(c.is_cancelled());
    }
}
