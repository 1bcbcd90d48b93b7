//! Requirements and the registry that tracks them.
//!
//! A [`Requirement`] is owned by the caller. The registry only keeps a
//! weak reference tagged with an arena slot and generation, so a caller
//! that drops its requirement without unregistering simply falls out of
//! the next resolution.

use crate::domain::config::DeviceConfig;
use crate::domain::models::{GestureId, SensorId, UpdateInterval};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::debug;

#[derive(Debug)]
struct RequirementState {
    name: String,
    config: DeviceConfig,
    revision: u64,
}

/// A named, caller-owned desired configuration.
#[derive(Debug)]
pub struct Requirement {
    state: Rc<RefCell<RequirementState>>,
}

impl Requirement {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, DeviceConfig::disabled())
    }

    pub fn with_config(name: impl Into<String>, config: DeviceConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(RequirementState {
                name: name.into(),
                config,
                revision: 0,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub fn config(&self) -> DeviceConfig {
        self.state.borrow().config.clone()
    }

    pub fn set_config(&self, config: DeviceConfig) {
        self.edit(|c| *c = config);
    }

    pub fn enable_sensor(&self, id: SensorId) {
        self.edit(|c| c.set_sensor(id, true));
    }

    pub fn disable_sensor(&self, id: SensorId) {
        self.edit(|c| c.set_sensor(id, false));
    }

    pub fn enable_gesture(&self, id: GestureId) {
        self.edit(|c| c.set_gesture(id, true));
    }

    pub fn disable_gesture(&self, id: GestureId) {
        self.edit(|c| c.set_gesture(id, false));
    }

    pub fn set_update_interval(&self, interval: UpdateInterval) {
        self.edit(|c| c.set_update_interval(interval));
    }

    pub fn disable_all(&self) {
        self.edit(|c| *c = DeviceConfig::disabled());
    }

    fn edit(&self, f: impl FnOnce(&mut DeviceConfig)) {
        let mut state = self.state.borrow_mut();
        f(&mut state.config);
        state.revision += 1;
    }
}

/// Non-owning handle to a registered requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequirementHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Entry {
    state: Weak<RefCell<RequirementState>>,
    seen_revision: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Small generation-tagged arena of requirement handles.
#[derive(Debug, Default)]
pub struct RequirementRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    dirty: bool,
}

impl RequirementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `requirement`. Registering the same requirement twice
    /// returns the existing handle.
    pub fn register(&mut self, requirement: &Requirement) -> RequirementHandle {
        if let Some(handle) = self.find(requirement) {
            return handle;
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry {
            state: Rc::downgrade(&requirement.state),
            seen_revision: requirement.state.borrow().revision,
        });
        self.dirty = true;

        debug!(name = %requirement.name(), index, "requirement registered");
        RequirementHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Returns false for a stale or unknown handle.
    pub fn unregister(&mut self, handle: RequirementHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }
        self.release(handle.index);
        debug!(index = handle.index, "requirement unregistered");
        true
    }

    pub fn contains(&self, handle: RequirementHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .map(|slot| slot.generation == handle.generation && slot.entry.is_some())
            .unwrap_or(false)
    }

    /// Number of occupied slots, including ones whose owner is gone but
    /// which have not been swept yet.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose owner no longer exists. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let dead: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.entry
                    .as_ref()
                    .is_some_and(|entry| entry.state.strong_count() == 0)
            })
            .map(|(index, _)| index as u32)
            .collect();

        for index in &dead {
            self.release(*index);
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "pruned dropped requirements");
        }
        dead.len()
    }

    /// Whether anything changed since the last call: registrations,
    /// dropped owners, or edits to a live requirement.
    pub fn take_changed(&mut self) -> bool {
        self.sweep();
        let mut changed = std::mem::take(&mut self.dirty);
        for entry in self.slots.iter_mut().filter_map(|s| s.entry.as_mut()) {
            if let Some(state) = entry.state.upgrade() {
                let revision = state.borrow().revision;
                if revision != entry.seen_revision {
                    entry.seen_revision = revision;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Configurations of every live requirement, pruning dead ones first.
    pub fn live_configs(&mut self) -> Vec<DeviceConfig> {
        self.sweep();
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter_map(|entry| entry.state.upgrade())
            .map(|state| state.borrow().config.clone())
            .collect()
    }

    fn find(&self, requirement: &Requirement) -> Option<RequirementHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .filter(|entry| {
                    std::ptr::eq(entry.state.as_ptr(), Rc::as_ptr(&requirement.state))
                })
                .map(|_| RequirementHandle {
                    index: index as u32,
                    generation: slot.generation,
                })
        })
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let mut registry = RequirementRegistry::new();
        let requirement = Requirement::new("head tracking");
        requirement.enable_sensor(SensorId::RotationVector);

        let handle = registry.register(&requirement);
        assert!(registry.contains(handle));
        assert_eq!(registry.register(&requirement), handle);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.live_configs(), vec![requirement.config()]);

        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut registry = RequirementRegistry::new();
        let first = Requirement::new("first");
        let old = registry.register(&first);
        registry.unregister(old);

        let second = Requirement::new("second");
        let new = registry.register(&second);
        assert!(!registry.contains(old));
        assert!(registry.contains(new));
        assert!(!registry.unregister(old));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dropped_owner_is_pruned() {
        let mut registry = RequirementRegistry::new();
        let kept = Requirement::new("kept");
        kept.enable_gesture(GestureId::HeadNod);
        registry.register(&kept);
        {
            let dropped = Requirement::new("dropped");
            dropped.enable_sensor(SensorId::Accelerometer);
            registry.register(&dropped);
        }
        assert!(registry.take_changed());

        assert_eq!(registry.live_configs(), vec![kept.config()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_changed_tracks_edits() {
        let mut registry = RequirementRegistry::new();
        let requirement = Requirement::new("gestures");
        registry.register(&requirement);

        assert!(registry.take_changed());
        assert!(!registry.take_changed());

        requirement.enable_gesture(GestureId::DoubleTap);
        assert!(registry.take_changed());
        assert!(!registry.take_changed());
    }

    #[test]
    fn test_dropped_owner_reports_change_once() {
        let mut registry = RequirementRegistry::new();
        let kept = Requirement::new("kept");
        registry.register(&kept);
        let dropped = Requirement::new("dropped");
        registry.register(&dropped);
        assert!(registry.take_changed());

        drop(dropped);
        assert!(registry.take_changed());
        assert_eq!(registry.len(), 1);
        assert!(!registry.take_changed());
        assert!(!registry.take_changed());
    }
}
