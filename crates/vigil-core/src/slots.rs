//! Face slot assignment: which detection in this frame is "the same face" as
//! one seen in earlier frames.

use crate::types::BoundingBox;
use std::collections::HashMap;

/// Stable key for one tracked face position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

/// Default number of consecutive frames a slot may go unmatched before it retires.
pub const DEFAULT_MAX_MISSED: usize = 15;
/// Default minimum IoU for a detection to continue an existing slot.
pub const DEFAULT_MIN_IOU: f32 = 0.3;

/// Maps each frame's detections onto slot ids.
pub trait SlotAssigner: Send {
    /// One slot id per input box, in input order.
    fn assign(&mut self, boxes: &[BoundingBox]) -> Vec<SlotId>;

    /// Slots retired since the last call.
    fn drain_retired(&mut self) -> Vec<SlotId>;
}

/// Keys slots on exact integer box coordinates.
///
/// Identical coordinates rarely recur on live video, so slots are short-lived;
/// kept for parity with simple deployments.
pub struct ExactBoxSlots {
    slots: HashMap<(i32, i32, i32, i32), (SlotId, usize)>,
    frame: usize,
    next_id: u64,
    max_missed: usize,
    retired: Vec<SlotId>,
}

impl ExactBoxSlots {
    pub fn new(max_missed: usize) -> Self {
        Self {
            slots: HashMap::new(),
            frame: 0,
            next_id: 1,
            max_missed,
            retired: Vec::new(),
        }
    }
}

impl Default for ExactBoxSlots {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSED)
    }
}

impl SlotAssigner for ExactBoxSlots {
    fn assign(&mut self, boxes: &[BoundingBox]) -> Vec<SlotId> {
        self.frame += 1;
        let frame = self.frame;

        let ids = boxes
            .iter()
            .map(|b| {
                let entry = self.slots.entry(b.pixel_corners()).or_insert_with(|| {
                    let id = SlotId(self.next_id);
                    self.next_id += 1;
                    (id, frame)
                });
                entry.1 = frame;
                entry.0
            })
            .collect();

        let max_missed = self.max_missed;
        let retired = &mut self.retired;
        self.slots.retain(|_, (id, seen)| {
            let keep = frame - *seen <= max_missed;
            if !keep {
                retired.push(*id);
            }
            keep
        });

        ids
    }

    fn drain_retired(&mut self) -> Vec<SlotId> {
        std::mem::take(&mut self.retired)
    }
}

#[derive(Debug, Clone)]
struct LiveSlot {
    id: SlotId,
    bbox: BoundingBox,
    missed: usize,
}

/// Greedy IoU association between this frame's boxes and live slots.
pub struct IouSlots {
    live: Vec<LiveSlot>,
    next_id: u64,
    min_iou: f32,
    max_missed: usize,
    retired: Vec<SlotId>,
}

impl IouSlots {
    pub fn new(min_iou: f32, max_missed: usize) -> Self {
        Self {
            live: Vec::new(),
            next_id: 1,
            min_iou,
            max_missed,
            retired: Vec::new(),
        }
    }
}

impl Default for IouSlots {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_IOU, DEFAULT_MAX_MISSED)
    }
}

impl SlotAssigner for IouSlots {
    fn assign(&mut self, boxes: &[BoundingBox]) -> Vec<SlotId> {
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (si, slot) in self.live.iter().enumerate() {
            for (bi, b) in boxes.iter().enumerate() {
                let iou = slot.bbox.iou(b);
                if iou >= self.min_iou {
                    pairs.push((si, bi, iou));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut slot_taken = vec![false; self.live.len()];
        let mut assigned: Vec<Option<SlotId>> = vec![None; boxes.len()];
        for (si, bi, _) in pairs {
            if slot_taken[si] || assigned[bi].is_some() {
                continue;
            }
            slot_taken[si] = true;
            assigned[bi] = Some(self.live[si].id);
            self.live[si].bbox = boxes[bi].clone();
            self.live[si].missed = 0;
        }

        for (slot, taken) in self.live.iter_mut().zip(&slot_taken) {
            if !taken {
                slot.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        let retired = &mut self.retired;
        self.live.retain(|s| {
            let keep = s.missed <= max_missed;
            if !keep {
                retired.push(s.id);
            }
            keep
        });

        assigned
            .into_iter()
            .zip(boxes)
            .map(|(id, b)| {
                id.unwrap_or_else(|| {
                    let id = SlotId(self.next_id);
                    self.next_id += 1;
                    self.live.push(LiveSlot { id, bbox: b.clone(), missed: 0 });
                    id
                })
            })
            .collect()
    }

    fn drain_retired(&mut self) -> Vec<SlotId> {
        std::mem::take(&mut self.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x: f32, y: f32) -> BoundingBox {
        BoundingBox::new(x, y, x + 50.0, y + 50.0)
    }

    #[test]
    fn test_exact_same_coordinates_share_slot() {
        let mut slots = ExactBoxSlots::default();
        let a = slots.assign(&[bx(10.0, 10.0)]);
        let b = slots.assign(&[bx(10.4, 10.2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_exact_moved_box_gets_new_slot() {
        let mut slots = ExactBoxSlots::default();
        let a = slots.assign(&[bx(10.0, 10.0)]);
        let b = slots.assign(&[bx(12.0, 10.0)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_exact_retires_stale_slots() {
        let mut slots = ExactBoxSlots::new(2);
        let a = slots.assign(&[bx(10.0, 10.0)]);
        for _ in 0..3 {
            slots.assign(&[]);
        }
        assert_eq!(slots.drain_retired(), a);
        assert!(slots.drain_retired().is_empty());
    }

    #[test]
    fn test_iou_follows_moving_face() {
        let mut slots = IouSlots::default();
        let first = slots.assign(&[bx(100.0, 100.0)]);
        let second = slots.assign(&[bx(105.0, 102.0)]);
        let third = slots.assign(&[bx(110.0, 104.0)]);
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn test_iou_two_faces_keep_their_slots() {
        let mut slots = IouSlots::default();
        let ids = slots.assign(&[bx(0.0, 0.0), bx(300.0, 0.0)]);
        // Reverse input order; ids must follow the boxes.
        let swapped = slots.assign(&[bx(302.0, 1.0), bx(2.0, 1.0)]);
        assert_eq!(swapped, vec![ids[1], ids[0]]);
    }

    #[test]
    fn test_iou_distant_box_is_new_slot() {
        let mut slots = IouSlots::default();
        let a = slots.assign(&[bx(0.0, 0.0)]);
        let b = slots.assign(&[bx(400.0, 400.0)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_iou_slot_survives_short_gap() {
        let mut slots = IouSlots::new(DEFAULT_MIN_IOU, 3);
        let a = slots.assign(&[bx(50.0, 50.0)]);
        slots.assign(&[]);
        slots.assign(&[]);
        let b = slots.assign(&[bx(52.0, 50.0)]);
        assert_eq!(a, b);
        assert!(slots.drain_retired().is_empty());
    }

    #[test]
    fn test_iou_slot_retires_after_max_missed() {
        let mut slots = IouSlots::new(DEFAULT_MIN_IOU, 1);
        let a = slots.assign(&[bx(50.0, 50.0)]);
        slots.assign(&[]);
        slots.assign(&[]);
        assert_eq!(slots.drain_retired(), a);
        let b = slots.assign(&[bx(50.0, 50.0)]);
        assert_ne!(a, b);
    }
}
