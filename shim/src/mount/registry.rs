//! Mount Instance Registry
//!
//! Every live mount of the process, in mount order. Workers consult it to
//! tell a request meant for a sibling mount from a stale one, and process
//! shutdown drains it to release whatever is still mounted.

use std::sync::Arc;

use spin::Mutex;
use crate::mount::MountInstance;

#[derive(Default)]
pub struct Registry {
    instances: Mutex<Vec<Arc<MountInstance>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: Arc<MountInstance>) {
        log::debug!("registry: add mount {}", instance.mount_id());
        self.instances.lock().push(instance);
    }

    /// Remove `instance`; returns false if it was not registered.
    pub fn unregister(&self, instance: &Arc<MountInstance>) -> bool {
        let mut instances = self.instances.lock();
        match instances.iter().position(|entry| Arc::ptr_eq(entry, instance)) {
            Some(position) => {
                instances.remove(position);
                log::debug!("registry: remove mount {}", instance.mount_id());
                true
            }
            None => false,
        }
    }

    pub fn find(&self, mount_id: u32) -> Option<Arc<MountInstance>> {
        self.instances
            .lock()
            .iter()
            .find(|instance| instance.mount_id() == mount_id)
            .cloned()
    }

    /// Remove and return every instance, oldest first
    pub fn drain(&self) -> Vec<Arc<MountInstance>> {
        core::mem::take(&mut *self.instances.lock())
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::control::DriverInfo;
    use crate::mount::options::MountOptions;
    use crate::testing::MemoryFileSystem;
    use widestring::U16CString;

    fn instance(mount_id: u32, mount_point: &str) -> Arc<MountInstance> {
        Arc::new(MountInstance::new(
            MountOptions::new(mount_point),
            Arc::new(MemoryFileSystem::with_entries("\\", &[])),
            DriverInfo {
                driver_version: 0x190,
                device_number: mount_id,
                mount_id,
                device_name: U16CString::from_str_truncate("\\Device\\V"),
            },
        ))
    }

    #[test]
    fn test_register_find_unregister() {
        let registry = Registry::new();
        let first = instance(1, "M");
        let second = instance(2, "N");
        registry.register(first.clone());
        registry.register(second.clone());

        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.find(1).unwrap(), &first));
        assert!(Arc::ptr_eq(&registry.find(2).unwrap(), &second));
        assert!(registry.find(3).is_none());

        assert!(registry.unregister(&first));
        assert!(!registry.unregister(&first));
        assert!(registry.find(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain_empties() {
        let registry = Registry::new();
        registry.register(instance(1, "M"));
        registry.register(instance(2, "N"));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].mount_id(), 1);
        assert!(registry.is_empty());
    }
}
