use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use agent_engine::{QueryControl, StreamChannel, UserTurn};

use crate::error::OrchestratorError;

/// One live session: the prompt channel feeding the engine plus the query's
/// control handle.
pub struct ChannelEntry {
    pub session_id: String,
    pub generation: u64,
    pub input: StreamChannel<UserTurn>,
    pub control: Arc<dyn QueryControl>,
    interrupted: Arc<AtomicBool>,
}

impl fmt::Debug for ChannelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEntry")
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .field("input", &self.input)
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}

impl ChannelEntry {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        generation: u64,
        input: StreamChannel<UserTurn>,
        control: Arc<dyn QueryControl>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            generation,
            input,
            control,
            interrupted,
        }
    }

    pub fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupted(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Forceful teardown of the engine side. Idempotent.
    pub fn shutdown(&self) {
        self.input.close();
        self.control.close();
    }
}

enum Slot {
    /// A start is in flight; no operation may see a channel yet.
    Reserved { generation: u64 },
    Live(Arc<ChannelEntry>),
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Self::Reserved { generation } => *generation,
            Self::Live(entry) => entry.generation,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<String, Slot>,
    next_generation: u64,
}

/// `session id -> channel` map. Every mutation happens under one lock that
/// is never held across an await.
#[derive(Default)]
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ChannelRegistry")
            .field("slots", &state.slots.len())
            .field("next_generation", &state.next_generation)
            .finish()
    }
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `session_id` for a start and returns the generation the new
    /// channel must carry.
    pub fn reserve(&self, session_id: &str) -> Result<u64, OrchestratorError> {
        let mut state = self.lock_state();
        if state.slots.contains_key(session_id) {
            return Err(OrchestratorError::SessionAlreadyActive(session_id.to_string()));
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .slots
            .insert(session_id.to_string(), Slot::Reserved { generation });
        Ok(generation)
    }

    /// Publishes the channel for a reservation. Returns false when the
    /// reservation was cleared in the meantime; the caller owns teardown.
    #[must_use]
    pub fn commit(&self, entry: Arc<ChannelEntry>) -> bool {
        let mut state = self.lock_state();
        match state.slots.get(&entry.session_id) {
            Some(Slot::Reserved { generation }) if *generation == entry.generation => {
                state
                    .slots
                    .insert(entry.session_id.clone(), Slot::Live(entry));
                true
            }
            _ => false,
        }
    }

    /// Drops a reservation after a failed start.
    pub fn rollback(&self, session_id: &str, generation: u64) {
        let mut state = self.lock_state();
        if matches!(
            state.slots.get(session_id),
            Some(Slot::Reserved { generation: reserved }) if *reserved == generation
        ) {
            state.slots.remove(session_id);
        }
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<ChannelEntry>> {
        match self.lock_state().slots.get(session_id) {
            Some(Slot::Live(entry)) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<ChannelEntry>> {
        match self.lock_state().slots.remove(session_id) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Removes the channel only if it is still the given generation, so a
    /// stale forwarding task never evicts a newer channel.
    pub fn remove_generation(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Option<Arc<ChannelEntry>> {
        let mut state = self.lock_state();
        if state.slots.get(session_id).map(Slot::generation) != Some(generation) {
            return None;
        }
        match state.slots.remove(session_id) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Empties the registry, reservations included, returning the live
    /// channels.
    pub fn drain(&self) -> Vec<Arc<ChannelEntry>> {
        let mut state = self.lock_state();
        state
            .slots
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Live(entry) => Some(entry),
                Slot::Reserved { .. } => None,
            })
            .collect()
    }

    /// Session ids with a live channel, sorted.
    #[must_use]
    pub fn live_session_ids(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut ids: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().slots.is_empty()
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        lock_unpoisoned(&self.state)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use agent_engine::{EngineError, PermissionMode};
    use async_trait::async_trait;

    use super::*;

    struct Inert;

    #[async_trait]
    impl QueryControl for Inert {
        async fn interrupt(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn set_permission_mode(&self, _mode: PermissionMode) -> Result<(), EngineError> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn entry(session_id: &str, generation: u64) -> Arc<ChannelEntry> {
        Arc::new(ChannelEntry::new(
            session_id,
            generation,
            StreamChannel::new(),
            Arc::new(Inert),
            Arc::new(AtomicBool::new(false)),
        ))
    }

    #[test]
    fn reserved_slots_block_starts_but_are_not_visible() {
        let registry = ChannelRegistry::new();
        let generation = registry.reserve("s1").expect("first reserve");

        assert!(matches!(
            registry.reserve("s1"),
            Err(OrchestratorError::SessionAlreadyActive(id)) if id == "s1"
        ));
        assert!(registry.get("s1").is_none());
        assert!(registry.live_session_ids().is_empty());

        assert!(registry.commit(entry("s1", generation)));
        assert_eq!(registry.live_session_ids(), vec!["s1".to_string()]);
    }

    #[test]
    fn rollback_frees_the_slot() {
        let registry = ChannelRegistry::new();
        let generation = registry.reserve("s1").expect("reserve");
        registry.rollback("s1", generation);

        assert!(registry.is_empty());
        assert!(registry.reserve("s1").is_ok());
    }

    #[test]
    fn commit_fails_after_drain_cleared_the_reservation() {
        let registry = ChannelRegistry::new();
        let generation = registry.reserve("s1").expect("reserve");

        assert!(registry.drain().is_empty());
        assert!(!registry.commit(entry("s1", generation)));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_generation_does_not_remove_newer_channel() {
        let registry = ChannelRegistry::new();
        let old = registry.reserve("s1").expect("reserve");
        assert!(registry.commit(entry("s1", old)));
        registry.remove("s1");

        let new = registry.reserve("s1").expect("reserve again");
        assert!(registry.commit(entry("s1", new)));

        assert!(registry.remove_generation("s1", old).is_none());
        assert!(registry.get("s1").is_some());
        assert!(registry.remove_generation("s1", new).is_some());
    }

    #[test]
    fn interrupt_flag_is_shared_with_the_entry() {
        let flag = Arc::new(AtomicBool::new(false));
        let entry = ChannelEntry::new(
            "s1",
            1,
            StreamChannel::new(),
            Arc::new(Inert),
            Arc::clone(&flag),
        );

        entry.mark_interrupted();
        assert!(flag.load(Ordering::SeqCst));
        entry.clear_interrupted();
        assert!(!entry.is_interrupted());
    }
}
