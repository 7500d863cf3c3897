use std::collections::BTreeMap;

use sidecar_bridge_error::BridgeError;

/// Integer handle identifying one registered provider across the process
/// boundary.
pub type Handle = u64;

/// Handle → registration map. Handles come from a strictly increasing
/// counter and are never handed out twice within a process.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    next_handle: Handle,
    entries: BTreeMap<Handle, T>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            entries: BTreeMap::new(),
        }
    }

    pub fn allocate(&mut self, metadata: T) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(handle, metadata);
        handle
    }

    /// Record a handle allocated by the remote side.
    pub fn insert(&mut self, handle: Handle, metadata: T) -> Result<(), BridgeError> {
        if self.entries.contains_key(&handle) {
            return Err(BridgeError::DuplicateRegistration {
                handle,
                message: format!("handle {handle} is already registered"),
            });
        }
        self.next_handle = self.next_handle.max(handle.saturating_add(1));
        self.entries.insert(handle, metadata);
        Ok(())
    }

    /// Unknown handles are ignored; teardown messages may race process exit.
    pub fn unregister(&mut self, handle: Handle) -> Option<T> {
        self.entries.remove(&handle)
    }

    pub fn lookup(&self, handle: Handle) -> Result<&T, BridgeError> {
        self.entries
            .get(&handle)
            .ok_or(BridgeError::UnknownProvider { handle })
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.entries.iter().map(|(handle, metadata)| (*handle, metadata))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn live_handles_never_collide() {
        let mut registry = HandleRegistry::new();
        let mut issued = HashSet::new();
        for round in 0..50u64 {
            let handle = registry.allocate(round);
            assert!(issued.insert(handle), "handle {handle} issued twice");
            if round % 3 == 0 {
                registry.unregister(handle);
            }
        }
        let live: Vec<_> = registry.iter().map(|(handle, _)| handle).collect();
        let unique: HashSet<_> = live.iter().copied().collect();
        assert_eq!(live.len(), unique.len());
    }

    #[test]
    fn remote_handles_reject_duplicates_and_bump_counter() {
        let mut registry = HandleRegistry::new();
        registry.insert(7, "code-editing").expect("first insert");
        let err = registry.insert(7, "again").expect_err("duplicate");
        assert!(matches!(err, BridgeError::DuplicateRegistration { handle: 7, .. }));
        assert_eq!(registry.allocate("local"), 8);
        assert_eq!(*registry.lookup(7).expect("lookup"), "code-editing");
    }

    #[test]
    fn unregister_twice_is_a_no_op() {
        let mut registry = HandleRegistry::new();
        registry.insert(3, ()).expect("insert");
        assert!(registry.unregister(3).is_some());
        assert!(registry.unregister(3).is_none());
        assert_eq!(
            registry.lookup(3).expect_err("gone"),
            BridgeError::UnknownProvider { handle: 3 }
        );
    }
}
