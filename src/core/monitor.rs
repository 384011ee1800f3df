//! Counter delta tracking across broker status snapshots.

use std::collections::HashMap;
use std::time::SystemTime;

use tracing::info;

/// One counter that moved between snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    pub key: String,
    pub previous: u64,
    pub current: u64,
}

/// Compares each status snapshot against the previous one and reports
/// the counters that changed. Counters absent from the prior snapshot
/// baseline at zero.
#[derive(Debug, Default)]
pub struct StatusMonitor {
    last: Option<HashMap<String, u64>>,
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a snapshot and returns the deltas, logging one line per
    /// changed counter. An empty snapshot leaves the stored state
    /// untouched.
    pub fn observe(
        &mut self,
        counters: &HashMap<String, u64>,
        _at: SystemTime,
    ) -> Vec<CounterDelta> {
        let mut deltas: Vec<CounterDelta> = counters
            .iter()
            .filter_map(|(key, &current)| {
                let previous = self
                    .last
                    .as_ref()
                    .and_then(|last| last.get(key))
                    .copied()
                    .unwrap_or(0);
                (previous != current).then(|| CounterDelta {
                    key: key.clone(),
                    previous,
                    current,
                })
            })
            .collect();
        deltas.sort_by(|a, b| a.key.cmp(&b.key));

        for delta in &deltas {
            info!("    {} : {} -> {}", delta.key, delta.previous, delta.current);
        }

        if !counters.is_empty() {
            self.last = Some(counters.clone());
        }
        deltas
    }
}
