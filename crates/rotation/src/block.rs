use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Rotation,
    Override,
}

/// A computed "who is on call" interval. Never persisted.
///
/// `start` is inclusive and `end` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBlock {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub user_id: Uuid,
    pub layer_id: Uuid,
    pub source: BlockSource,
}

impl ScheduleBlock {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Half-open interval intersection, `None` when disjoint or touching.
    pub fn intersection(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let s = self.start.max(start);
        let e = self.end.min(end);
        (s < e).then_some((s, e))
    }

    pub(crate) fn with_span(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            ..self.clone()
        }
    }
}
