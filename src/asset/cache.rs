use super::Handle;

/// Slot table addressed by 16 bit handles. Freed slots are reused, so a
/// stale handle may alias a newer item; owners must drop handles on removal.
pub struct AssetCache<T> {
    items: Vec<Option<T>>,
    free: Vec<u16>,
}

impl<T> AssetCache<T> {
    /// Highest usable index; `0xFFFF` is reserved for the invalid handle.
    pub const CAPACITY: usize = Handle::<T>::INVALID_INDEX as usize;

    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Returns `None` when all handles are in use.
    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        if let Some(index) = self.free.pop() {
            self.items[index as usize] = Some(item);
            return Some(Handle::new(index));
        }
        if self.items.len() >= Self::CAPACITY {
            return None;
        }
        let index = self.items.len() as u16;
        self.items.push(Some(item));
        Some(Handle::new(index))
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let item = self.items.get_mut(handle.index())?.take();
        if item.is_some() {
            self.free.push(handle.raw());
        }
        item
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.items.get_mut(handle.index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|item| (Handle::new(i as u16), item)))
    }
}

impl<T> Default for AssetCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_invalid_handle_returns_none() {
        let cache: AssetCache<u32> = AssetCache::default();
        assert!(cache.get(Handle::new(999)).is_none());
        assert!(cache.get(Handle::INVALID).is_none());
    }

    #[test]
    fn get_valid_handle_returns_some() {
        let mut cache = AssetCache::default();
        let handle = cache.insert(42u32).expect("free slot");
        assert_eq!(cache.get(handle), Some(&42));
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut cache = AssetCache::default();
        let a = cache.insert(1u32).expect("free slot");
        let _b = cache.insert(2u32).expect("free slot");
        assert_eq!(cache.remove(a), Some(1));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(a).is_none());
        let c = cache.insert(3u32).expect("free slot");
        assert_eq!(c, a);
        assert_eq!(cache.remove(Handle::INVALID), None);
    }
}
