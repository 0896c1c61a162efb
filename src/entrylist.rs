//! Generation-tagged slot arena used by [`crate::frame::FrameArena`] and
//! [`crate::buffer::BufferArena`] so that a handle into a shared, growable
//! list can stay stable across inserts/removals without a pointer graph.

/// Entry based list using generation markers to identify
/// used list items in an efficient list.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Entry {
    id: usize,
    gen: usize,
}

impl Entry {
    pub(crate) fn new(id: usize, gen: usize) -> Self {
        Self { id, gen }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct EntryList<T> {
    items: Vec<(usize, Option<T>)>,
    free_entrys: Vec<Entry>,
}

impl<T> Default for EntryList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntryList<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            free_entrys: Vec::new(),
        }
    }

    /// active_slots returns how many slots still have a value.
    pub fn active_slots(&self) -> usize {
        self.items.len() - self.free_entrys.len()
    }

    /// allocated_slots returns how many slots have been allocated overall.
    pub fn allocated_slots(&self) -> usize {
        self.items.len()
    }

    pub fn get_mut(&mut self, entry: &Entry) -> Option<&mut T> {
        if let Some((gen, value)) = self.items.get_mut(entry.id) {
            if *gen == entry.gen {
                return value.as_mut();
            }
        }
        None
    }

    pub fn get(&self, entry: &Entry) -> Option<&T> {
        if let Some((gen, value)) = self.items.get(entry.id) {
            if *gen == entry.gen {
                return value.as_ref();
            }
        }
        None
    }

    /// has returns whether the entry still points at a live value.
    pub fn has(&self, entry: &Entry) -> bool {
        matches!(self.items.get(entry.id), Some((gen, Some(_))) if *gen == entry.gen)
    }

    /// vacate drops the value behind `entry`, freeing the slot for reuse.
    pub fn vacate(&mut self, entry: &Entry) {
        if let Some((gen, value)) = self.items.get_mut(entry.id) {
            if *gen == entry.gen {
                if let Some(con) = value.take() {
                    self.free_entrys.push(*entry);
                    drop(con);
                }
            }
        }
    }

    pub fn take(&mut self, entry: &Entry) -> Option<T> {
        if let Some((gen, value)) = self.items.get_mut(entry.id) {
            if *gen == entry.gen {
                if let Some(con) = value.take() {
                    self.free_entrys.push(*entry);
                    return Some(con);
                }
            }
        }
        None
    }

    /// inserts a new value into the list, returning a stable handle to it.
    pub fn insert(&mut self, item: T) -> Entry {
        let entry = match self.free_entrys.pop() {
            Some(mut inner) => {
                inner.gen += 1;
                inner
            }
            None => Entry {
                id: self.items.len(),
                gen: 0,
            },
        };

        if self.items.len() == entry.id {
            self.items.push((entry.gen, Some(item)));
        } else {
            self.items[entry.id] = (entry.gen, Some(item));
        }

        entry
    }
}
