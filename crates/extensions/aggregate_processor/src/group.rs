use crate::IdentificationKeysMap;
use prepper_api::Event;
use serde_json::Map;
use serde_json::Value;
use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::TryLockError;
use std::time::Duration;
use std::time::Instant;

/// An aggregation window for the events sharing the same identification keys
///
/// The state of the window is owned by the handle lock,
/// so it can only be read or updated by a thread holding that lock.
/// The conclude lock serializes conclusions
/// and holds back new events while the window is being concluded.
///
/// The start of the window can be read without any lock,
/// so checking whether a group is due never waits for a busy action.
pub struct AggregateGroup {
    identification_keys: IdentificationKeysMap,
    group_start: Arc<WindowStart>,
    conclude_lock: Mutex<()>,
    handle_lock: Mutex<AggregateActionInput>,
}

/// What an action is given to process an event or conclude a window
pub struct AggregateActionInput {
    identification_keys: IdentificationKeysMap,
    group_state: GroupState,
    group_start: Arc<WindowStart>,
}

/// Start of the current window, as an offset from the creation of the group
///
/// Only updated by the holder of the handle lock.
struct WindowStart {
    origin: Instant,
    offset_nanos: AtomicU64,
}

impl WindowStart {
    fn new(origin: Instant) -> Self {
        WindowStart {
            origin,
            offset_nanos: AtomicU64::new(0),
        }
    }

    fn get(&self) -> Instant {
        self.origin + Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire))
    }

    fn set(&self, start: Instant) {
        let offset = start.saturating_duration_since(self.origin).as_nanos();
        self.offset_nanos
            .store(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Release);
    }

    fn is_over(&self, group_duration: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.get()) >= group_duration
    }
}

/// Per-group state, for the exclusive use of the aggregate action
///
/// Holds JSON entries, from which concluded events are built,
/// plus typed values for the actions that need more than JSON.
#[derive(Default)]
pub struct GroupState {
    entries: Map<String, Value>,
    extensions: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl AggregateGroup {
    pub fn new(identification_keys: IdentificationKeysMap, now: Instant) -> Self {
        let input = AggregateActionInput::new(identification_keys.clone(), now);
        AggregateGroup {
            identification_keys,
            group_start: input.group_start.clone(),
            conclude_lock: Mutex::new(()),
            handle_lock: Mutex::new(input),
        }
    }

    pub fn identification_keys(&self) -> &IdentificationKeysMap {
        &self.identification_keys
    }

    pub fn group_start(&self) -> Instant {
        self.group_start.get()
    }

    /// Lock-free check that the current window is over
    ///
    /// The window might be reset right after. Hence this has to be checked again under the handle lock.
    pub fn should_conclude_group(&self, group_duration: Duration, now: Instant) -> bool {
        self.group_start.is_over(group_duration, now)
    }

    /// Block till the handle lock is acquired
    pub fn lock_handle(&self) -> MutexGuard<'_, AggregateActionInput> {
        self.handle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block till the conclude lock is acquired
    pub fn lock_conclude(&self) -> MutexGuard<'_, ()> {
        self.conclude_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the conclude lock, unless already held
    pub fn try_lock_conclude(&self) -> Option<MutexGuard<'_, ()>> {
        match self.conclude_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl AggregateActionInput {
    pub fn new(identification_keys: IdentificationKeysMap, now: Instant) -> Self {
        AggregateActionInput {
            identification_keys,
            group_state: GroupState::default(),
            group_start: Arc::new(WindowStart::new(now)),
        }
    }

    pub fn identification_keys(&self) -> &IdentificationKeysMap {
        &self.identification_keys
    }

    pub fn group_state(&self) -> &GroupState {
        &self.group_state
    }

    pub fn group_state_mut(&mut self) -> &mut GroupState {
        &mut self.group_state
    }

    pub fn group_start(&self) -> Instant {
        self.group_start.get()
    }

    pub fn should_conclude_group(&self, group_duration: Duration, now: Instant) -> bool {
        self.group_start.is_over(group_duration, now)
    }

    /// Start a new window: the state is cleared and the window starts `now`
    pub fn reset_group(&mut self, now: Instant) {
        self.group_state.clear();
        self.group_start.set(now);
    }
}

impl GroupState {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn extend(&mut self, entries: Map<String, Value>) {
        self.entries.extend(entries)
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    /// True when there are neither JSON entries nor typed values
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.extensions.is_empty()
    }

    /// Build an event from the JSON entries
    pub fn to_event(&self) -> Event {
        Event::from_map(self.entries.clone())
    }

    pub fn extension<T: Any + Send>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn extension_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    pub fn insert_extension<T: Any + Send>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn remove_extension<T: Any + Send>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok())
            .map(|value| *value)
    }

    pub fn extension_or_insert_with<T: Any + Send>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        let value = self
            .extensions
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(init()));
        match value.downcast_mut() {
            Some(value) => value,
            None => unreachable!("extensions are indexed by their type id"),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.extensions.clear();
    }
}
