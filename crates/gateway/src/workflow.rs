//! Per-stream workflow bookkeeping shared by both recognition services.
//!
//! A stream key is IDLE (absent from the map), RUNNING (present with
//! `active = true`) or WINDING-DOWN (present with `active = false` after an
//! external stop; the in-flight iteration finishes and does not re-arm).
//! The registry only tracks state; spawning the pipeline fiber is the
//! caller's job, which keeps the registry free of service specifics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Outcome of the post-iteration check in the re-arm path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Schedule the next iteration.
    Continue,
    /// Stopped externally or internally; the key has been cleaned up.
    Stop,
    /// The workflow deadline passed; the key has been cleaned up.
    Timeout,
}

#[derive(Default)]
pub struct WorkflowRegistry {
    active: Mutex<HashMap<String, bool>>,
    timeouts: Mutex<HashMap<String, Instant>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` active and record its deadline. Returns `true` when no
    /// iteration is in flight, i.e. the caller must spawn one.
    pub fn begin(&self, key: &str, workflow_timeout: Duration) -> bool {
        let spawn = {
            let mut active = self.active.lock();
            let absent = !active.contains_key(key);
            active.insert(key.to_string(), true);
            absent
        };
        if workflow_timeout > Duration::ZERO {
            self.timeouts
                .lock()
                .insert(key.to_string(), Instant::now() + workflow_timeout);
        }
        spawn
    }

    /// Stop a workflow. An internal stop (pipeline cleanup) removes the key;
    /// an external stop flips it to winding-down so the in-flight iteration
    /// exits without re-arming.
    pub fn stop(&self, key: &str, is_internal: bool) {
        {
            let mut active = self.active.lock();
            if active.contains_key(key) {
                if is_internal {
                    active.remove(key);
                } else {
                    active.insert(key.to_string(), false);
                }
            }
        }
        self.timeouts.lock().remove(key);
    }

    /// Post-iteration decision: continue, stop, or stop-by-timeout. Cleans
    /// the key up on anything but `Continue`.
    pub fn next(&self, key: &str) -> Continuation {
        let is_timeout = {
            let now = Instant::now();
            let mut timeouts = self.timeouts.lock();
            match timeouts.get(key) {
                Some(deadline) if *deadline < now => {
                    timeouts.remove(key);
                    true
                }
                _ => false,
            }
        };

        let mut active = self.active.lock();
        match active.get(key) {
            Some(true) if !is_timeout => Continuation::Continue,
            Some(_) => {
                active.remove(key);
                if is_timeout {
                    Continuation::Timeout
                } else {
                    Continuation::Stop
                }
            }
            None => Continuation::Stop,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.active.lock().get(key).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_spawns_only_once() {
        let registry = WorkflowRegistry::new();
        assert!(registry.begin("1_cam", Duration::ZERO));
        // Re-arming an already running workflow must not spawn a second fiber.
        assert!(!registry.begin("1_cam", Duration::ZERO));
        assert!(registry.is_running("1_cam"));
    }

    #[test]
    fn external_stop_winds_down() {
        let registry = WorkflowRegistry::new();
        registry.begin("1_cam", Duration::ZERO);
        registry.stop("1_cam", false);
        assert!(!registry.is_running("1_cam"));
        // The in-flight iteration observes the stop and cleans up.
        assert_eq!(registry.next("1_cam"), Continuation::Stop);
        // Key is gone; a later start spawns again.
        assert!(registry.begin("1_cam", Duration::ZERO));
    }

    #[test]
    fn internal_stop_removes_key() {
        let registry = WorkflowRegistry::new();
        registry.begin("1_cam", Duration::ZERO);
        registry.stop("1_cam", true);
        assert_eq!(registry.next("1_cam"), Continuation::Stop);
        assert!(registry.begin("1_cam", Duration::ZERO));
    }

    #[test]
    fn running_workflow_continues() {
        let registry = WorkflowRegistry::new();
        registry.begin("1_cam", Duration::ZERO);
        assert_eq!(registry.next("1_cam"), Continuation::Continue);
        assert_eq!(registry.next("1_cam"), Continuation::Continue);
    }

    #[test]
    fn deadline_stops_with_timeout() {
        let registry = WorkflowRegistry::new();
        registry.begin("1_cam", Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(registry.next("1_cam"), Continuation::Timeout);
        assert!(!registry.is_running("1_cam"));
    }

    #[test]
    fn restart_refreshes_deadline() {
        let registry = WorkflowRegistry::new();
        registry.begin("1_cam", Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        // Restart before the check: new deadline wins.
        registry.begin("1_cam", Duration::from_secs(60));
        assert_eq!(registry.next("1_cam"), Continuation::Continue);
    }

    #[test]
    fn keys_are_independent() {
        let registry = WorkflowRegistry::new();
        registry.begin("1_a", Duration::ZERO);
        registry.begin("1_b", Duration::ZERO);
        registry.stop("1_a", false);
        assert_eq!(registry.next("1_a"), Continuation::Stop);
        assert_eq!(registry.next("1_b"), Continuation::Continue);
    }
}
