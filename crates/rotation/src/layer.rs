//! Rotation blocks for a single layer.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use oncall_core::OnCallLayer;

use crate::block::{BlockSource, ScheduleBlock};

/// Upper bound on blocks emitted for one layer and window. A one-hour
/// rotation displayed over a year would otherwise produce ~8,800 blocks.
pub const MAX_BLOCKS_PER_LAYER: usize = 2_000;

/// Contiguous rotation blocks of `layer` clipped to `[window_start, window_end)`
/// and to the layer's own end.
///
/// The user for a block is `members[floor((block_start - layer_start) / R) mod N]`
/// with members ordered by position. Degenerate layers (no members,
/// non-positive rotation length) and windows outside the layer's lifetime
/// yield no blocks.
pub fn generate_layer_blocks(
    layer: &OnCallLayer,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<ScheduleBlock> {
    if layer.members.is_empty() || layer.rotation_hours <= 0 {
        return Vec::new();
    }
    if window_end <= layer.start {
        return Vec::new();
    }
    if matches!(layer.end, Some(end) if window_start >= end) {
        return Vec::new();
    }

    let effective_start = window_start.max(layer.start);
    let effective_end = match layer.end {
        Some(end) => window_end.min(end),
        None => window_end,
    };
    if effective_start >= effective_end {
        return Vec::new();
    }

    let mut members = layer.members.clone();
    members.sort_by_key(|m| m.position);
    let n = members.len() as i64;

    let rotation_secs = layer.rotation_hours * 3_600;
    let mut index = (effective_start - layer.start).num_seconds() / rotation_secs;
    let mut cursor = effective_start;
    let mut blocks = Vec::new();

    while cursor < effective_end {
        if blocks.len() >= MAX_BLOCKS_PER_LAYER {
            warn!(
                layer_id = %layer.id,
                rotation_hours = layer.rotation_hours,
                "rotation block cap reached, truncating output"
            );
            break;
        }

        let rotation_end = layer.start + Duration::seconds(rotation_secs * (index + 1));
        let block_end = rotation_end.min(effective_end);
        let member = &members[index.rem_euclid(n) as usize];

        blocks.push(ScheduleBlock {
            id: format!("{}:{}", layer.id, index),
            start: cursor,
            end: block_end,
            user_id: member.user_id,
            layer_id: layer.id,
            source: BlockSource::Rotation,
        });

        cursor = block_end;
        index += 1;
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use oncall_core::LayerMember;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
    }

    fn layer_of(users: &[Uuid], rotation_hours: i64) -> OnCallLayer {
        OnCallLayer {
            id: Uuid::new_v4(),
            name: "layer".to_string(),
            start: t0(),
            end: None,
            rotation_hours,
            members: users
                .iter()
                .enumerate()
                .map(|(i, u)| LayerMember { user_id: *u, position: i as u32 })
                .collect(),
        }
    }

    fn hours(h: i64) -> DateTime<Utc> {
        t0() + Duration::hours(h)
    }

    #[test]
    fn assigns_users_by_rotation_index() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let layer = layer_of(&[a, b], 24);

        let blocks = generate_layer_blocks(&layer, hours(24), hours(72));
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].user_id, blocks[0].start, blocks[0].end), (b, hours(24), hours(48)));
        assert_eq!((blocks[1].user_id, blocks[1].start, blocks[1].end), (a, hours(48), hours(72)));
    }

    #[test]
    fn blocks_tile_the_window_without_gaps() {
        let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let layer = layer_of(&users, 8);
        let (ws, we) = (hours(5), hours(5 + 24 * 4 + 3));

        let blocks = generate_layer_blocks(&layer, ws, we);
        assert_eq!(blocks.first().map(|b| b.start), Some(ws));
        assert_eq!(blocks.last().map(|b| b.end), Some(we));
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for block in &blocks {
            let idx = (block.start - t0()).num_hours() / 8;
            assert_eq!(block.user_id, users[(idx % 3) as usize]);
        }
    }

    #[test]
    fn members_are_ordered_by_position_not_insertion() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut layer = layer_of(&[a, b], 24);
        layer.members[0].position = 5;
        let blocks = generate_layer_blocks(&layer, hours(0), hours(24));
        assert_eq!(blocks[0].user_id, b);
    }

    #[test]
    fn clipped_to_layer_end() {
        let a = Uuid::new_v4();
        let mut layer = layer_of(&[a], 24);
        layer.end = Some(hours(36));

        let blocks = generate_layer_blocks(&layer, hours(0), hours(96));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].end, hours(36));
    }

    #[test]
    fn degenerate_inputs_yield_nothing() {
        let a = Uuid::new_v4();
        assert!(generate_layer_blocks(&layer_of(&[], 24), hours(0), hours(48)).is_empty());
        assert!(generate_layer_blocks(&layer_of(&[a], 0), hours(0), hours(48)).is_empty());
        assert!(generate_layer_blocks(&layer_of(&[a], -4), hours(0), hours(48)).is_empty());
        // Window entirely before the layer starts.
        assert!(generate_layer_blocks(&layer_of(&[a], 24), hours(-48), hours(-1)).is_empty());

        let mut closed = layer_of(&[a], 24);
        closed.end = Some(hours(10));
        assert!(generate_layer_blocks(&closed, hours(10), hours(20)).is_empty());
    }

    #[test]
    fn window_before_layer_start_is_clipped_to_start() {
        let a = Uuid::new_v4();
        let blocks = generate_layer_blocks(&layer_of(&[a], 24), hours(-10), hours(10));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, hours(0));
    }

    #[test]
    fn pathological_rotation_is_capped() {
        let layer = layer_of(&[Uuid::new_v4(), Uuid::new_v4()], 1);
        let blocks = generate_layer_blocks(&layer, hours(0), hours(24 * 365));
        assert_eq!(blocks.len(), MAX_BLOCKS_PER_LAYER);
    }
}
