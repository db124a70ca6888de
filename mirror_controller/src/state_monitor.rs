use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

/// Periodically evaluates the configured interlocks and logs every interlock
/// that becomes matched or clears.
pub async fn run_interlock_monitor(dispatcher: Arc<Dispatcher>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    let mut active: BTreeSet<String> = BTreeSet::new();

    loop {
        interval.tick().await;

        let matched: BTreeSet<String> = dispatcher
            .interlock_matches()
            .into_iter()
            .map(|interlock| {
                if !active.contains(&interlock.label) {
                    warn!(
                        interlock = %interlock.label,
                        description = %interlock.description,
                        "Forbidden position reached"
                    );
                }
                interlock.label
            })
            .collect();

        for cleared in active.difference(&matched) {
            info!(interlock = %cleared, "Forbidden position cleared");
        }
        active = matched;
    }
}
