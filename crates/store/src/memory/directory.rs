use async_trait::async_trait;
use uuid::Uuid;

use oncall_core::{Channel, Schedule, Team};

use crate::error::StoreResult;
use crate::traits::Directory;

use super::MemoryStore;

#[async_trait]
impl Directory for MemoryStore {
    async fn team(&self, id: Uuid) -> StoreResult<Option<Team>> {
        let mut state = self.lock();
        state.fault("team")?;
        Ok(state.teams.get(&id).cloned())
    }

    async fn schedule(&self, id: Uuid) -> StoreResult<Option<Schedule>> {
        let mut state = self.lock();
        state.fault("schedule")?;
        Ok(state.schedules.get(&id).cloned())
    }

    async fn preferred_channels(&self, user_id: Uuid) -> StoreResult<Vec<Channel>> {
        let mut state = self.lock();
        state.fault("preferred_channels")?;
        Ok(state.channels.get(&user_id).cloned().unwrap_or_default())
    }
}
