//! Probe callbacks used by the daemon

use crate::manager::{CustomEvent, ProbeHooks};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};

/// Logs custom events and tracks the dentry cache generation
#[derive(Debug, Default)]
pub struct DaemonHooks {
    generation: AtomicU64,
    custom_events: AtomicU64,
}

impl DaemonHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cache generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Number of custom events dispatched so far
    pub fn custom_events(&self) -> u64 {
        self.custom_events.load(Ordering::Relaxed)
    }
}

impl ProbeHooks for DaemonHooks {
    fn dispatch_custom_event(&self, event: CustomEvent) {
        self.custom_events.fetch_add(1, Ordering::Relaxed);
        match serde_json::to_string(&event) {
            Ok(json) => warn!("custom event: {}", json),
            Err(e) => warn!("custom event {:?} (serialization failed: {})", event, e),
        }
    }

    fn bump_cache_generations(&self) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("dentry cache generation is now {}", generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_generation_bumps() {
        let hooks = DaemonHooks::new();
        hooks.bump_cache_generations();
        hooks.bump_cache_generations();
        assert_eq!(hooks.generation(), 2);
    }

    #[test]
    fn test_custom_event_json() {
        let hooks = DaemonHooks::new();
        let mut per_event = BTreeMap::new();
        per_event.insert("exec".to_string(), 4);
        let event = CustomEvent::LostEventsWrite {
            map: "events".to_string(),
            per_event,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lost_events_write");
        assert_eq!(json["per_event"]["exec"], 4);

        hooks.dispatch_custom_event(event);
        assert_eq!(hooks.custom_events(), 1);
    }
}
