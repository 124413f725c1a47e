//! Conversation scheduler.
//!
//! Owns one cancellable timer per running pair. Each tick runs a single turn:
//! pick the speaker by alternation, generate a line, relay it through the
//! gateway and, only once the gateway accepted it, record it.

use crate::api::events::Notifier;
use crate::api::gateway::{MessageGateway, SendOutcome};
use crate::api::models::{ChipPair, Connection, HistoryTurn, Message, RunStatus, Side, Stats};
use crate::api::openai::{GenerationRequest, TextGenerator};
use crate::app::MaturationConfig;
use crate::error::{Error, Result};
use crate::storage::Store;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub first_turn_delay: Duration,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub context_turns: usize,
    pub default_prompt: String,
}

impl From<&MaturationConfig> for SchedulerSettings {
    fn from(c: &MaturationConfig) -> Self {
        Self {
            first_turn_delay: Duration::from_millis(c.first_turn_delay_ms),
            min_interval_secs: c.min_interval_secs,
            max_interval_secs: c.max_interval_secs,
            context_turns: c.context_turns,
            default_prompt: c.default_prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StartOutcome {
    Started { pairs: usize },
    AlreadyRunning,
    NoEligiblePairs,
}

struct PairTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Store,
    generator: Arc<dyn TextGenerator>,
    gateway: Arc<dyn MessageGateway>,
    notifier: Notifier,
    settings: SchedulerSettings,
    running: AtomicBool,
    /// Held by start, stop, sync and shutdown so the running flag and the
    /// timer map always change together.
    lifecycle: Mutex<()>,
    timers: Mutex<HashMap<String, PairTimer>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Cheap to clone; every clone drives the same timers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Marks a pair as mid-turn until dropped.
struct TurnGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    pair_id: String,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.pair_id);
    }
}

impl Scheduler {
    pub fn new(
        store: Store,
        generator: Arc<dyn TextGenerator>,
        gateway: Arc<dyn MessageGateway>,
        notifier: Notifier,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                generator,
                gateway,
                notifier,
                settings,
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                timers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn timer_count(&self) -> usize {
        self.timers().len()
    }

    pub fn has_timer(&self, pair_id: &str) -> bool {
        self.timers().contains_key(pair_id)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, PairTimer>> {
        self.inner.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Active, unpaused pairs whose chips are both connected.
    pub fn eligible_pairs(&self) -> Result<Vec<ChipPair>> {
        let active: HashSet<String> = self
            .inner
            .store
            .list_connections()?
            .into_iter()
            .filter(Connection::is_active)
            .map(|c| c.id)
            .collect();
        Ok(self
            .inner
            .store
            .list_pairs()?
            .into_iter()
            .filter(|p| {
                p.is_active
                    && p.status != RunStatus::Paused
                    && active.contains(&p.first_chip_id)
                    && active.contains(&p.second_chip_id)
            })
            .collect())
    }

    pub fn start(&self) -> Result<StartOutcome> {
        let _lifecycle = self.lifecycle();
        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        let pairs = self.eligible_pairs()?;
        if pairs.is_empty() {
            self.inner.notifier.error(
                "Maturador not started",
                "Configure at least one active chip pair to start",
            );
            return Ok(StartOutcome::NoEligiblePairs);
        }
        if self.shared_prompt()?.is_none() && !pairs.iter().any(|p| p.override_prompt().is_some()) {
            return Err(Error::Validation(
                "Configure a global prompt or pair-specific prompts before starting".into(),
            ));
        }

        self.inner.running.store(true, Ordering::SeqCst);
        for pair in &pairs {
            self.inner.store.set_pair_status(&pair.id, RunStatus::Running)?;
            self.spawn_timer(&pair.id);
        }
        log::info!("maturador started with {} pair(s)", pairs.len());
        self.inner.notifier.success(
            "Maturador started",
            format!("Automatic conversations enabled for {} pair(s)", pairs.len()),
        );
        Ok(StartOutcome::Started { pairs: pairs.len() })
    }

    /// Cancels every timer. A turn already talking to a collaborator is
    /// allowed to finish; no new turn begins.
    pub fn stop(&self) -> Result<usize> {
        let _lifecycle = self.lifecycle();
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        let cancelled: Vec<(String, PairTimer)> = self.timers().drain().collect();
        for (_, timer) in &cancelled {
            timer.cancel.cancel();
        }
        for pair in self.inner.store.list_pairs()? {
            if pair.status != RunStatus::Stopped {
                self.inner.store.set_pair_status(&pair.id, RunStatus::Stopped)?;
            }
        }
        if was_running {
            log::info!("maturador stopped, {} timer(s) cancelled", cancelled.len());
            self.inner
                .notifier
                .info("Maturador stopped", "Automatic conversations disabled");
        }
        Ok(cancelled.len())
    }

    /// Brings a pair's timer in line with its flags after the operator changed it.
    pub fn sync_pair(&self, pair: &ChipPair) -> Result<()> {
        let _lifecycle = self.lifecycle();
        if !pair.is_active {
            self.cancel_timer(&pair.id);
            if pair.status == RunStatus::Running {
                self.inner.store.set_pair_status(&pair.id, RunStatus::Paused)?;
            }
            return Ok(());
        }
        if !self.is_running() {
            if pair.status == RunStatus::Paused {
                self.inner.store.set_pair_status(&pair.id, RunStatus::Stopped)?;
            }
            return Ok(());
        }
        if self.chips_active(pair)? && !self.has_timer(&pair.id) {
            self.inner.store.set_pair_status(&pair.id, RunStatus::Running)?;
            self.spawn_timer(&pair.id);
        }
        Ok(())
    }

    /// Drops the timer of a pair that no longer exists.
    pub fn forget_pair(&self, pair_id: &str) {
        self.cancel_timer(pair_id);
    }

    fn chips_active(&self, pair: &ChipPair) -> Result<bool> {
        let first = self.inner.store.get_connection(&pair.first_chip_id)?;
        let second = self.inner.store.get_connection(&pair.second_chip_id)?;
        Ok(matches!((first, second), (Some(a), Some(b)) if a.is_active() && b.is_active()))
    }

    fn cancel_timer(&self, pair_id: &str) {
        if let Some(timer) = self.timers().remove(pair_id) {
            timer.cancel.cancel();
            log::debug!("timer for pair {pair_id} cancelled");
        }
    }

    fn spawn_timer(&self, pair_id: &str) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scheduler = self.clone();
        let id = pair_id.to_string();
        let settings = self.inner.settings.clone();

        let handle = tokio::spawn(async move {
            let mut delay = settings.first_turn_delay;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match scheduler.run_turn(&id).await {
                    Ok(_) => {}
                    Err(Error::NotFound(_)) => {
                        log::info!("pair {id} is gone, its timer ends");
                        break;
                    }
                    Err(Error::Validation(reason)) => {
                        log::warn!("turn for pair {id} skipped: {reason}");
                        scheduler.inner.notifier.error("Turn skipped", reason);
                    }
                    // Remote and generation failures already raised a notice.
                    Err(e) => log::warn!("turn for pair {id} failed: {e}"),
                }
                delay = crate::utils::random_interval(settings.min_interval_secs, settings.max_interval_secs);
            }
        });

        if let Some(previous) = self.timers().insert(pair_id.to_string(), PairTimer { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    /// Global prompt from the library, else the configured default.
    fn shared_prompt(&self) -> Result<Option<String>> {
        let global = self
            .inner
            .store
            .global_prompt()?
            .map(|p| p.content)
            .filter(|c| !c.trim().is_empty());
        Ok(global.or_else(|| {
            Some(self.inner.settings.default_prompt.clone()).filter(|c| !c.trim().is_empty())
        }))
    }

    pub fn effective_prompt(&self, pair: &ChipPair) -> Result<Option<String>> {
        match pair.override_prompt() {
            Some(p) => Ok(Some(p.to_string())),
            None => self.shared_prompt(),
        }
    }

    /// Runs one turn for the pair. Nothing is recorded unless the gateway
    /// accepted the message.
    pub async fn run_turn(&self, pair_id: &str) -> Result<Message> {
        let _guard = {
            let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(pair_id.to_string()) {
                return Err(Error::Validation(format!("a turn is already running for pair {pair_id}")));
            }
            TurnGuard { in_flight: &self.inner.in_flight, pair_id: pair_id.to_string() }
        };

        let store = &self.inner.store;
        let pair = store
            .get_pair(pair_id)?
            .ok_or_else(|| Error::NotFound(format!("pair {pair_id}")))?;
        if !pair.is_active {
            return Err(Error::Validation(format!("pair {} is paused", pair.label())));
        }
        let first = store
            .get_connection(&pair.first_chip_id)?
            .ok_or_else(|| Error::NotFound(format!("connection {}", pair.first_chip_id)))?;
        let second = store
            .get_connection(&pair.second_chip_id)?
            .ok_or_else(|| Error::NotFound(format!("connection {}", pair.second_chip_id)))?;
        if !first.is_active() || !second.is_active() {
            return Err(Error::Validation(format!(
                "both chips of {} must be active",
                pair.label()
            )));
        }

        let side = pair.next_speaker(store.last_sender(&pair.id)?.as_deref());
        let (speaker, receiver) = match side {
            Side::First => (&first, &second),
            Side::Second => (&second, &first),
        };
        debug_assert_eq!(pair.chip_id(side.other()), receiver.id);

        let prompt = self
            .effective_prompt(&pair)?
            .ok_or_else(|| Error::Validation("no prompt configured".into()))?;
        let history = store
            .recent_messages(&pair.id, self.inner.settings.context_turns)?
            .into_iter()
            .map(|m| HistoryTurn { is_from_speaker: m.from_chip_id == speaker.id, content: m.content })
            .collect();

        let request = GenerationRequest {
            speaker_name: speaker.name.clone(),
            prompt,
            history,
        };
        let generated = match self.inner.generator.generate(&request).await {
            Ok(g) => g,
            Err(e) => return Err(self.turn_failed(&pair, e)),
        };

        let gateway_message_id = match self
            .inner
            .gateway
            .send_message(&speaker.instance_name, &receiver.phone, &generated.text)
            .await
        {
            Ok(SendOutcome::Sent { message_id }) => message_id,
            Ok(SendOutcome::Rejected { error }) => {
                return Err(self.turn_failed(&pair, Error::Remote(format!("gateway rejected message: {error}"))));
            }
            Err(e) => return Err(self.turn_failed(&pair, e)),
        };

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            pair_id: pair.id.clone(),
            from_chip_id: speaker.id.clone(),
            from_chip_name: speaker.name.clone(),
            to_chip_id: receiver.id.clone(),
            to_chip_name: receiver.name.clone(),
            content: generated.text,
            timestamp: Utc::now(),
            model: generated.model,
            usage: generated.usage,
            gateway_message_id,
        };
        store.record_turn(&message)?;
        log::info!("message sent: {} -> {}", message.from_chip_name, message.to_chip_name);
        Ok(message)
    }

    fn turn_failed(&self, pair: &ChipPair, err: Error) -> Error {
        self.inner.notifier.error(
            "Conversation error",
            format!("Failed to exchange a message for {}: {err}", pair.label()),
        );
        err
    }

    /// Newest first.
    pub fn pair_messages(&self, pair_id: &str) -> Result<Vec<Message>> {
        self.inner.store.pair_messages(pair_id)
    }

    pub fn stats(&self) -> Result<Stats> {
        let store = &self.inner.store;
        let active_pairs = store.list_pairs()?.iter().filter(|p| p.is_active).count();
        Ok(Stats {
            active_pairs,
            total_messages: store.count_messages(None)?,
            messages_last_24h: store.count_messages(Some(Utc::now() - ChronoDuration::hours(24)))?,
            is_running: self.is_running(),
        })
    }

    /// Stops everything and waits for the timer tasks to wind down. Returns
    /// how many of them had panicked.
    pub async fn shutdown(&self) -> usize {
        let timers: Vec<(String, PairTimer)> = {
            let _lifecycle = self.lifecycle();
            self.inner.running.store(false, Ordering::SeqCst);
            self.timers().drain().collect()
        };
        for (_, timer) in &timers {
            timer.cancel.cancel();
        }
        let mut panicked = 0;
        for (pair_id, timer) in timers {
            if let Err(e) = timer.handle.await {
                if e.is_panic() {
                    panicked += 1;
                    log::error!("timer for pair {pair_id} panicked: {e}");
                }
            }
        }
        panicked
    }
}
