use std::marker::PhantomData;

/// Typed 16 bit handle. `0xFFFF` marks an absent resource.
pub struct Handle<T> {
    index: u16,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls so `T` does not need to be Clone/Copy/Eq itself
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({})", self.index)
        } else {
            write!(f, "Handle(invalid)")
        }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> Handle<T> {
    pub const INVALID_INDEX: u16 = 0xFFFF;

    pub const INVALID: Handle<T> = Handle {
        index: Self::INVALID_INDEX,
        _marker: PhantomData,
    };

    pub const fn new(index: u16) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn raw(&self) -> u16 {
        self.index
    }

    pub fn is_valid(&self) -> bool {
        self.index != Self::INVALID_INDEX
    }

    /// Same slot, different resource type. Used where a public handle type
    /// addresses a backend-private table.
    pub const fn cast<U>(self) -> Handle<U> {
        Handle::new(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_copy() {
        let h1: Handle<String> = Handle::new(5);
        let h2 = h1;
        let h3 = h1;
        assert_eq!(h1.index(), h2.index());
        assert_eq!(h1.index(), h3.index());
    }

    #[test]
    fn default_handle_is_invalid() {
        let h: Handle<u8> = Handle::default();
        assert!(!h.is_valid());
        assert_eq!(h.raw(), 0xFFFF);
    }
}
