//! On-call rotation calculator.
//!
//! Turns rotating layers and manual overrides into concrete, time-bounded
//! "who is on call" blocks. Everything here is pure: no I/O, no persisted
//! state, safe to call repeatedly for display and for escalation target
//! resolution.

mod block;
mod layer;
mod overrides;

pub use block::{BlockSource, ScheduleBlock};
pub use layer::{generate_layer_blocks, MAX_BLOCKS_PER_LAYER};
pub use overrides::apply_overrides;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use oncall_core::{OnCallLayer, OnCallOverride, Schedule};

/// Compose layer generation and override application for a window.
///
/// Blocks from every layer are returned together, sorted by start time.
pub fn build_schedule_blocks(
    layers: &[OnCallLayer],
    overrides: &[OnCallOverride],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<ScheduleBlock> {
    let blocks: Vec<ScheduleBlock> = layers
        .iter()
        .flat_map(|layer| generate_layer_blocks(layer, window_start, window_end))
        .collect();
    apply_overrides(blocks, overrides)
}

/// Users on call at `at` across every active layer of a schedule.
///
/// Simultaneous layers are all honored; the result is their union in
/// first-seen order without duplicates.
pub fn users_on_call_at(schedule: &Schedule, at: DateTime<Utc>) -> Vec<Uuid> {
    let window_end = at + chrono::Duration::seconds(1);
    let blocks = build_schedule_blocks(&schedule.layers, &schedule.overrides, at, window_end);

    let mut users = Vec::new();
    for block in blocks.iter().filter(|b| b.contains(at)) {
        if !users.contains(&block.user_id) {
            users.push(block.user_id);
        }
    }
    users
}
