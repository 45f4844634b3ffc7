/// FlatStorage works like a map with automatically assigned keys. Each element
/// gets a `usize` key (its slot index) when added; the key is stable until the
/// element is removed and may later be reused for a different element.
///
/// The event loop stores socket entries and timers here so that poll keys are
/// plain indexes.
pub struct FlatStorage<T> {
    data: Vec<AllocNode<T>>,
    count: usize,
    free: usize,
}

const INVALID_ID: usize = usize::MAX;

enum AllocNode<T> {
    Vacant(usize), // next free slot index
    Occupied(T),
}

impl<T> Default for FlatStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlatStorage<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            count: 0,
            free: INVALID_ID,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the key assigned to the new element.
    pub fn add(&mut self, val: T) -> usize {
        self.count += 1;
        if self.free == INVALID_ID {
            self.data.push(AllocNode::Occupied(val));
            self.data.len() - 1
        } else {
            let key = self.free;
            match self.data[key] {
                AllocNode::Vacant(next) => {
                    self.free = next;
                }
                AllocNode::Occupied(_) => {
                    panic!("Expecting vacant slot pointed by free list.");
                }
            }
            self.data[key] = AllocNode::Occupied(val);
            key
        }
    }

    pub fn remove(&mut self, key: usize) -> bool {
        self.take(key).is_some()
    }

    /// Removes and returns the element at `key`, if occupied.
    pub fn take(&mut self, key: usize) -> Option<T> {
        if key < self.data.len() && matches!(self.data[key], AllocNode::Occupied(_)) {
            let node = std::mem::replace(&mut self.data[key], AllocNode::Vacant(self.free));
            self.free = key;
            self.count -= 1;
            if let AllocNode::Occupied(val) = node {
                return Some(val);
            }
        }
        None
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        if key < self.data.len() {
            if let AllocNode::Occupied(ref val) = self.data[key] {
                return Some(val);
            }
        }
        None
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        if key < self.data.len() {
            if let AllocNode::Occupied(ref mut val) = self.data[key] {
                return Some(val);
            }
        }
        None
    }

    /// Snapshot of all occupied keys. Used when removals happen while walking.
    pub fn keys(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, node)| match node {
                AllocNode::Occupied(_) => Some(i),
                AllocNode::Vacant(_) => None,
            })
            .collect()
    }
}
