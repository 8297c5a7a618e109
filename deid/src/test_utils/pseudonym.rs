use std::sync::atomic::{AtomicU64, Ordering};

use crate::identity::PseudonymGenerator;

/// Mints `00000000-0000-4000-8000-000000000001`, `...002` and so on.
#[derive(Debug, Default)]
pub struct SequentialPseudonymGenerator {
    next: AtomicU64,
}

impl SequentialPseudonymGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pseudonyms minted so far.
    pub fn minted(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl PseudonymGenerator for SequentialPseudonymGenerator {
    fn generate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("00000000-0000-4000-8000-{n:012x}")
    }
}
