//! Flat in-memory filesystem: a name → inode registry plus the `File`
//! handle layer the fd table and the loader consume. Removing a name
//! leaves existing handles usable; the inode is freed with its last
//! handle.

pub mod fd;
pub mod file;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts::gate;
use file::{File, Inode};

lazy_static! {
    static ref REGISTRY: Mutex<BTreeMap<String, Arc<Mutex<Inode>>>> = Mutex::new(BTreeMap::new());
}

pub fn init() {
    let _ = REGISTRY.lock();
    crate::log_info!("In-memory filesystem initialized.");
}

/// Create a zero-filled file of the given size. Fails if the name exists.
pub fn create(name: &str, initial_size: usize) -> bool {
    if name.is_empty() {
        return false;
    }
    gate::with_disabled(|| {
        let mut registry = REGISTRY.lock();
        if registry.contains_key(name) {
            return false;
        }
        registry.insert(
            String::from(name),
            Arc::new(Mutex::new(Inode::new(vec![0u8; initial_size]))),
        );
        true
    })
}

/// Unlink a name. Open handles keep working.
pub fn remove(name: &str) -> bool {
    gate::with_disabled(|| REGISTRY.lock().remove(name).is_some())
}

pub fn open(name: &str) -> Option<File> {
    gate::with_disabled(|| {
        let registry = REGISTRY.lock();
        registry.get(name).map(|inode| File::open(inode.clone()))
    })
}

/// Kernel-side helper: replace a file's contents wholesale. Used to seed
/// images at boot and by the test suite; user writes go through `File`.
pub fn write_file(name: &str, bytes: &[u8]) -> bool {
    gate::with_disabled(|| {
        let registry = REGISTRY.lock();
        match registry.get(name) {
            Some(inode) => {
                let mut inode = inode.lock();
                inode.data.clear();
                inode.data.extend_from_slice(bytes);
                true
            }
            None => false,
        }
    })
}
