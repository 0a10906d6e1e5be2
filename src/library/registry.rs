use crate::library::{engine_internals::Handle, request::ReceiveRequest};
use stable_vec::ExternStableVec;
use tracing::trace;

/// Slot table for in-flight receives.
///
/// Requests are stored boxed, so growing the table moves only the box
/// pointers, never the memory the kernel is writing into. Freed slots are
/// reused; each reuse bumps the slot generation so a stale tag cannot
/// resolve to the next occupant.
pub struct Registry {
    slots: ExternStableVec<Box<ReceiveRequest>>,
    generations: Vec<u32>,
    released_slots: Vec<u32>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Registry {
            slots: ExternStableVec::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            released_slots: Vec::with_capacity(capacity),
        }
    }

    /// Take ownership of `request` and return the handle it is filed under.
    pub fn insert(&mut self, request: Box<ReceiveRequest>) -> Handle {
        match self.released_slots.pop() {
            Some(slot) => {
                let previous = self.slots.insert(slot as usize, request);
                debug_assert!(previous.is_none(), "released slot {slot} was occupied");
                Handle {
                    slot,
                    generation: self.generations[slot as usize],
                }
            }
            None => {
                let slot = self.slots.push(request);
                self.generations.push(0);
                debug_assert_eq!(self.generations.len(), slot + 1);
                trace!("Registry grew to {} slots", slot + 1);
                Handle {
                    slot: slot as u32,
                    generation: 0,
                }
            }
        }
    }

    /// The handle the next [`Registry::insert`] will return.
    pub fn next_handle(&self) -> Handle {
        match self.released_slots.last() {
            Some(&slot) => Handle {
                slot,
                generation: self.generations[slot as usize],
            },
            None => Handle {
                slot: self.generations.len() as u32,
                generation: 0,
            },
        }
    }

    /// Borrow the request behind a live handle.
    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut ReceiveRequest> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots.get_mut(handle.slot as usize).map(|boxed| &mut **boxed)
    }

    /// Give the request back and free its slot. Stale handles resolve to nothing.
    pub fn remove(&mut self, handle: Handle) -> Option<Box<ReceiveRequest>> {
        if !self.is_live(handle) {
            return None;
        }
        let slot = handle.slot as usize;
        let request = self.slots.remove(slot)?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.released_slots.push(handle.slot);
        Some(request)
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        let slot = handle.slot as usize;
        self.generations.get(slot) == Some(&handle.generation) && self.slots.has_element_at(slot)
    }

    /// Number of requests currently owned by the kernel.
    pub fn len(&self) -> usize {
        self.slots.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand every request out without freeing it. Used at teardown, when the
    /// kernel may still write into memory we can no longer track.
    pub fn leak_all(&mut self) -> usize {
        let mut leaked = 0;
        let slots: Vec<usize> = self.slots.indices().collect();
        for slot in slots {
            if let Some(request) = self.slots.remove(slot) {
                std::mem::forget(request);
                leaked += 1;
            }
        }
        leaked
    }
}
