/// In-memory metadata with a restorable snapshot.
///
/// Index metadata (the hash directory, tree roots, counters) changes together
/// with block contents. The block file journal restores blocks; this wrapper
/// restores the matching metadata.
#[derive(Debug, Clone)]
pub struct Checkpointed<T: Clone> {
    current: T,
    saved: Option<T>,
}

impl<T: Clone> Checkpointed<T> {
    pub fn new(value: T) -> Self {
        Checkpointed {
            current: value,
            saved: None,
        }
    }

    pub fn get(&self) -> &T {
        &self.current
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.current
    }

    /// Remembers the current value. A checkpoint that is already open is kept.
    pub fn begin(&mut self) {
        if self.saved.is_none() {
            self.saved = Some(self.current.clone());
        }
    }

    pub fn commit(&mut self) {
        self.saved = None;
    }

    /// Restores the value captured by `begin`, if any.
    pub fn rollback(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.current = saved;
        }
    }

    pub fn is_open(&self) -> bool {
        self.saved.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_restores_value() {
        let mut value = Checkpointed::new(vec![1, 2]);
        value.begin();
        value.get_mut().push(3);
        value.begin();
        value.get_mut().push(4);
        value.rollback();
        assert_eq!(value.get(), &vec![1, 2]);
        assert!(!value.is_open());
    }

    #[test]
    fn test_commit_keeps_value() {
        let mut value = Checkpointed::new(0u32);
        value.begin();
        *value.get_mut() = 9;
        value.commit();
        value.rollback();
        assert_eq!(*value.get(), 9);
    }
}
