//! Request handles and the generational table that backs them.
//!
//! A [`RequestHandle`] is an index into [`HandleTable`] plus the generation the slot had when
//! the request was inserted. Removing an entry bumps the slot's generation, so a handle kept
//! around after its request retired can never resolve to a newer request reusing the slot.
//! The pair packs into the 64-bit `user_data` carried through the kernel queues.

use std::fmt;

/// Opaque token correlating a queued request with its completion
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    index: u32,
    generation: u32,
}

impl RequestHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Pack into the value stored in a submission entry's `user_data`
    pub(crate) const fn to_user_data(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`RequestHandle::to_user_data`]
    pub(crate) const fn from_user_data(user_data: u64) -> Self {
        Self {
            index: user_data as u32,
            generation: (user_data >> 32) as u32,
        }
    }

    #[cfg(test)]
    pub(crate) const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestHandle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena keyed by [`RequestHandle`]
pub(crate) struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> RequestHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            return RequestHandle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
            // Four billion simultaneously outstanding requests cannot be backed by memory.
            unreachable!("request table exhausted")
        });
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        RequestHandle::new(index, 1)
    }

    fn slot(&self, handle: RequestHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub(crate) fn contains(&self, handle: RequestHandle) -> bool {
        self.get(handle).is_some()
    }

    pub(crate) fn get(&self, handle: RequestHandle) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove the entry, invalidating every copy of `handle`
    pub(crate) fn remove(&mut self, handle: RequestHandle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        self.len -= 1;
        // A slot whose generation would wrap is retired for good; reusing it could let a
        // long-retired handle resolve again.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(handle.index);
        }
        Some(value)
    }

    /// Live entries with their handles, in slot order
    pub(crate) fn iter(&self) -> impl Iterator<Item = (RequestHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let value = slot.value.as_ref()?;
            Some((RequestHandle::new(index as u32, slot.generation), value))
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}
