//! Two-stage event deduplication per (stream, plate number), plus the
//! per-stream special-vehicle ban.
//!
//! Stage 1: after a number is processed it is ignored for `ban_duration`
//! regardless of where it appears. Stage 2: until `ban_duration_area`
//! elapses the number stays ignored while its box overlaps the stored one
//! (IoU above the threshold); once it moves, it is processed again and
//! re-enters stage 1.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use fp_domain::geometry::RectF;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct BannedPlate {
    stage1_until: Instant,
    stage2_until: Instant,
    bbox: RectF,
}

#[derive(Default)]
pub struct BanRegistry {
    plates: Mutex<HashMap<String, BannedPlate>>,
    special: Mutex<HashMap<String, Instant>>,
}

impl BanRegistry {
    pub fn new() -> BanRegistry {
        BanRegistry::default()
    }

    /// Check-and-update for one observed plate number. Returns `true` when
    /// the observation is suppressed.
    pub fn check_plate(
        &self,
        vstream_key: &str,
        number: &str,
        bbox: RectF,
        ban_duration: Duration,
        ban_duration_area: Duration,
        ban_iou_threshold: f32,
    ) -> bool {
        if ban_duration.is_zero() || ban_duration_area.is_zero() {
            return false;
        }
        let key = format!("{vstream_key}_{number}");
        let now = Instant::now();
        let mut stage1_until = now + ban_duration;
        let mut new_bbox = bbox;
        let mut banned = false;

        let mut plates = self.plates.lock();
        if let Some(entry) = plates.get(&key) {
            if entry.stage1_until > now {
                banned = true;
            } else {
                let iou = entry.bbox.iou(&bbox);
                banned = iou > ban_iou_threshold;
                if banned {
                    // Still parked in place: extend stage 2, keep the stored box.
                    new_bbox = entry.bbox;
                    stage1_until = entry.stage1_until;
                }
            }
        }
        plates.insert(
            key,
            BannedPlate {
                stage1_until,
                stage2_until: now + ban_duration_area,
                bbox: new_bbox,
            },
        );
        banned
    }

    /// Drop entries whose stage-2 deadline has passed.
    pub fn maintain(&self) {
        let now = Instant::now();
        self.plates.lock().retain(|_, entry| entry.stage2_until >= now);
    }

    pub fn is_special_banned(&self, vstream_key: &str) -> bool {
        let now = Instant::now();
        let mut special = self.special.lock();
        match special.get(vstream_key) {
            Some(until) if *until > now => true,
            Some(_) => {
                special.remove(vstream_key);
                false
            }
            None => false,
        }
    }

    pub fn ban_special(&self, vstream_key: &str, duration: Duration) {
        self.special
            .lock()
            .insert(vstream_key.to_string(), Instant::now() + duration);
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.plates.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "1_gate";
    const IOU: f32 = 0.5;

    fn bbox(x: f32) -> RectF {
        RectF {
            x,
            y: 0.0,
            width: 100.0,
            height: 40.0,
        }
    }

    #[test]
    fn first_sighting_is_processed_then_stage1_bans() {
        let bans = BanRegistry::new();
        let long = Duration::from_secs(60);
        assert!(!bans.check_plate(KEY, "A123BC77", bbox(0.0), long, long, IOU));
        // Same number immediately again, anywhere in the frame.
        assert!(bans.check_plate(KEY, "A123BC77", bbox(500.0), long, long, IOU));
    }

    #[test]
    fn stage2_bans_only_while_overlapping() {
        let bans = BanRegistry::new();
        let stage1 = Duration::from_millis(1);
        let stage2 = Duration::from_secs(60);
        assert!(!bans.check_plate(KEY, "A123BC77", bbox(0.0), stage1, stage2, IOU));
        std::thread::sleep(Duration::from_millis(5));
        // Stage 1 elapsed; same location keeps the ban.
        assert!(bans.check_plate(KEY, "A123BC77", bbox(1.0), stage1, stage2, IOU));
        // Moved away: un-banned, processed, and back to stage 1.
        assert!(!bans.check_plate(KEY, "A123BC77", bbox(400.0), stage1, stage2, IOU));
        assert!(bans.check_plate(KEY, "A123BC77", bbox(400.0), Duration::from_secs(60), stage2, IOU));
    }

    #[test]
    fn zero_durations_disable_banning() {
        let bans = BanRegistry::new();
        for _ in 0..3 {
            assert!(!bans.check_plate(
                KEY,
                "A123BC77",
                bbox(0.0),
                Duration::ZERO,
                Duration::from_secs(60),
                IOU,
            ));
        }
    }

    #[test]
    fn different_streams_do_not_interfere() {
        let bans = BanRegistry::new();
        let long = Duration::from_secs(60);
        assert!(!bans.check_plate("1_a", "A123BC77", bbox(0.0), long, long, IOU));
        assert!(!bans.check_plate("1_b", "A123BC77", bbox(0.0), long, long, IOU));
    }

    #[test]
    fn maintenance_drops_expired_stage2() {
        let bans = BanRegistry::new();
        let tiny = Duration::from_millis(1);
        bans.check_plate(KEY, "A123BC77", bbox(0.0), tiny, tiny, IOU);
        assert_eq!(bans.entry_count(), 1);
        std::thread::sleep(Duration::from_millis(5));
        bans.maintain();
        assert_eq!(bans.entry_count(), 0);
    }

    #[test]
    fn special_ban_expires() {
        let bans = BanRegistry::new();
        bans.ban_special(KEY, Duration::from_millis(2));
        assert!(bans.is_special_banned(KEY));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!bans.is_special_banned(KEY));
    }
}
