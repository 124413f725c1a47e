use crate::api::events::Notifier;
use crate::api::models::{ChipPair, RunStatus};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::storage::Store;
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPair {
    #[serde(default)]
    pub first_chip_id: String,
    #[serde(default)]
    pub second_chip_id: String,
}

/// Configured chip pairs. Activity changes are forwarded to the scheduler so
/// timers follow the flags.
#[derive(Clone)]
pub struct PairRegistry {
    store: Store,
    scheduler: Scheduler,
    notifier: Notifier,
}

impl PairRegistry {
    pub fn new(store: Store, scheduler: Scheduler, notifier: Notifier) -> Self {
        Self { store, scheduler, notifier }
    }

    pub fn list(&self) -> Result<Vec<ChipPair>> {
        self.store.list_pairs()
    }

    pub fn get(&self, id: &str) -> Result<ChipPair> {
        self.store
            .get_pair(id)?
            .ok_or_else(|| Error::NotFound(format!("pair {id}")))
    }

    pub fn add(&self, input: NewPair) -> Result<ChipPair> {
        let first_id = input.first_chip_id.trim();
        let second_id = input.second_chip_id.trim();
        if first_id.is_empty() || second_id.is_empty() {
            return Err(Error::Validation("select both chips to create a pair".into()));
        }
        if first_id == second_id {
            return Err(Error::Validation("a chip cannot be paired with itself".into()));
        }
        let mut chips = Vec::with_capacity(2);
        for id in [first_id, second_id] {
            let chip = self
                .store
                .get_connection(id)?
                .ok_or_else(|| Error::Validation(format!("unknown chip {id}")))?;
            if !chip.is_active() {
                return Err(Error::Validation(format!("{} is not active", chip.name)));
            }
            chips.push(chip);
        }
        if self.store.pair_exists_between(first_id, second_id)? {
            return Err(Error::Validation(format!(
                "{} and {} are already paired",
                chips[0].name, chips[1].name
            )));
        }

        let pair = ChipPair {
            id: uuid::Uuid::new_v4().to_string(),
            first_chip_id: chips[0].id.clone(),
            first_chip_name: chips[0].name.clone(),
            second_chip_id: chips[1].id.clone(),
            second_chip_name: chips[1].name.clone(),
            is_active: true,
            messages_count: 0,
            last_activity: Utc::now(),
            status: RunStatus::Stopped,
            use_instance_prompt: false,
            instance_prompt: None,
        };
        self.store.insert_pair(&pair)?;
        self.scheduler.sync_pair(&pair)?;
        self.notifier.success(
            "Pair configured",
            format!("{} - ready to start conversations", pair.label()),
        );
        self.get(&pair.id)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        if !self.store.delete_pair(id)? {
            return Err(Error::NotFound(format!("pair {id}")));
        }
        self.scheduler.forget_pair(id);
        Ok(())
    }

    pub fn toggle_active(&self, id: &str) -> Result<ChipPair> {
        let mut pair = self.get(id)?;
        pair.is_active = !pair.is_active;
        self.store.update_pair_settings(&pair)?;
        self.scheduler.sync_pair(&pair)?;
        self.get(id)
    }

    pub fn toggle_prompt_override(&self, id: &str) -> Result<ChipPair> {
        let mut pair = self.get(id)?;
        pair.use_instance_prompt = !pair.use_instance_prompt;
        self.store.update_pair_settings(&pair)?;
        Ok(pair)
    }

    /// Blank text clears the override.
    pub fn set_prompt(&self, id: &str, text: &str) -> Result<ChipPair> {
        let mut pair = self.get(id)?;
        let text = text.trim();
        pair.instance_prompt = if text.is_empty() { None } else { Some(text.to_string()) };
        self.store.update_pair_settings(&pair)?;
        Ok(pair)
    }
}
