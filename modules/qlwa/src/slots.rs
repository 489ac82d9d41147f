/// Fixed-capacity arena handing out small integer ids. Freed ids are reused
/// before new ones.
pub struct Slots<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
    capacity: usize,
    len: usize,
}

impl<T> Slots<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Store `item`, or hand it back if the arena is full.
    pub fn insert(&mut self, item: T) -> Result<usize, T> {
        if self.is_full() {
            return Err(item);
        }
        self.len += 1;
        if let Some(id) = self.free.pop() {
            self.items[id] = Some(item);
            return Ok(id);
        }
        self.items.push(Some(item));
        Ok(self.items.len() - 1)
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.items.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.items.get_mut(id).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        let item = self.items.get_mut(id)?.take()?;
        self.free.push(id);
        self.len -= 1;
        Some(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(id, item)| item.as_ref().map(|item| (id, item)))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.free.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_freed_ids() {
        let mut slots = Slots::with_capacity(2);
        let a = slots.insert("a").unwrap();
        let b = slots.insert("b").unwrap();
        assert!(slots.is_full());
        assert_eq!(slots.insert("c"), Err("c"));
        assert_eq!(slots.remove(a), Some("a"));
        assert_eq!(slots.remove(a), None);
        let c = slots.insert("c").unwrap();
        assert_eq!(c, a);
        assert_eq!(slots.get(b), Some(&"b"));
        assert_eq!(slots.iter().count(), 2);
    }
}
