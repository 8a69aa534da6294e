//! Override application on top of rotation blocks.

use oncall_core::OnCallOverride;

use crate::block::{BlockSource, ScheduleBlock};

/// Apply overrides to `blocks`, earliest start first.
///
/// Each override pass works on the previous pass's output, so where two
/// overrides overlap each other the later-starting one wins. An override
/// with a `replaces_user_id` leaves blocks of any other user untouched.
/// The intersected span becomes an override block; any remainder keeps
/// the original block's id and user.
pub fn apply_overrides(blocks: Vec<ScheduleBlock>, overrides: &[OnCallOverride]) -> Vec<ScheduleBlock> {
    let mut ordered: Vec<&OnCallOverride> = overrides.iter().filter(|o| o.start < o.end).collect();
    ordered.sort_by_key(|o| o.start);

    let mut current = blocks;
    for ov in ordered {
        let mut next = Vec::with_capacity(current.len() + 2);
        for block in current {
            let Some((start, end)) = block.intersection(ov.start, ov.end) else {
                next.push(block);
                continue;
            };
            if matches!(ov.replaces_user_id, Some(u) if u != block.user_id) {
                next.push(block);
                continue;
            }

            if block.start < start {
                next.push(block.with_span(block.start, start));
            }
            next.push(ScheduleBlock {
                id: format!("{}:override:{}", block.id, ov.id),
                start,
                end,
                user_id: ov.user_id,
                layer_id: block.layer_id,
                source: BlockSource::Override,
            });
            if end < block.end {
                next.push(block.with_span(end, block.end));
            }
        }
        current = next;
    }

    current.sort_by_key(|b| b.start);
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
    }

    fn block(user: Uuid, from_h: i64, to_h: i64) -> ScheduleBlock {
        ScheduleBlock {
            id: format!("layer:{from_h}"),
            start: t0() + Duration::hours(from_h),
            end: t0() + Duration::hours(to_h),
            user_id: user,
            layer_id: Uuid::nil(),
            source: BlockSource::Rotation,
        }
    }

    fn ov(user: Uuid, from_h: i64, to_h: i64, replaces: Option<Uuid>) -> OnCallOverride {
        OnCallOverride {
            id: Uuid::new_v4(),
            user_id: user,
            start: t0() + Duration::hours(from_h),
            end: t0() + Duration::hours(to_h),
            replaces_user_id: replaces,
        }
    }

    fn spans(blocks: &[ScheduleBlock]) -> Vec<(Uuid, i64, i64)> {
        blocks
            .iter()
            .map(|b| (b.user_id, (b.start - t0()).num_hours(), (b.end - t0()).num_hours()))
            .collect()
    }

    #[test]
    fn replaces_constraint_mismatch_leaves_block_alone() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let out = apply_overrides(vec![block(a, 0, 24)], &[ov(c, 2, 4, Some(b))]);
        assert_eq!(spans(&out), vec![(a, 0, 24)]);
    }

    #[test]
    fn override_spanning_two_blocks_replaces_both_halves() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let out = apply_overrides(vec![block(a, 0, 24), block(b, 24, 48)], &[ov(c, 20, 30, None)]);
        assert_eq!(spans(&out), vec![(a, 0, 20), (c, 20, 24), (c, 24, 30), (b, 30, 48)]);
    }

    #[test]
    fn override_covering_whole_block_leaves_no_remainder() {
        let (a, c) = (Uuid::new_v4(), Uuid::new_v4());
        let out = apply_overrides(vec![block(a, 0, 24)], &[ov(c, -5, 30, None)]);
        assert_eq!(spans(&out), vec![(c, 0, 24)]);
    }

    #[test]
    fn later_starting_override_wins_overlap() {
        let (a, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        // Passed out of order on purpose: application order is by start.
        let out = apply_overrides(vec![block(a, 0, 24)], &[ov(d, 6, 12, None), ov(c, 4, 10, None)]);
        // D splits both C's remainder and the following rotation remainder.
        assert_eq!(spans(&out), vec![(a, 0, 4), (c, 4, 6), (d, 6, 10), (d, 10, 12), (a, 12, 24)]);
    }

    #[test]
    fn empty_or_inverted_override_is_ignored() {
        let (a, c) = (Uuid::new_v4(), Uuid::new_v4());
        let out = apply_overrides(vec![block(a, 0, 24)], &[ov(c, 5, 5, None), ov(c, 8, 6, None)]);
        assert_eq!(spans(&out), vec![(a, 0, 24)]);
    }

    #[test]
    fn chained_replacement_follows_previous_pass() {
        let (a, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        // Second override only replaces C, which exists only after the first pass.
        let out = apply_overrides(vec![block(a, 0, 24)], &[ov(c, 2, 10, None), ov(d, 4, 6, Some(c))]);
        assert_eq!(spans(&out), vec![(a, 0, 2), (c, 2, 4), (d, 4, 6), (c, 6, 10), (a, 10, 24)]);
    }
}
