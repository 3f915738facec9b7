//! Kernel operations for MemoryStore

use super::{lock, sorted, MemoryStore};
use crate::error::StoreError;
use crate::models::*;
use chrono::Utc;

pub fn get_kernel(store: &MemoryStore, id: u64) -> Result<Kernel, StoreError> {
    lock(&store.kernels)
        .get(&id)
        .filter(|k| k.is_live())
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("Kernel {} not found", id)))
}

pub fn find_kernel_by_name(store: &MemoryStore, name: &str) -> Option<Kernel> {
    lock(&store.kernels)
        .values()
        .find(|k| k.is_live() && k.name == name)
        .cloned()
}

pub fn list_kernels(store: &MemoryStore) -> Vec<Kernel> {
    sorted(lock(&store.kernels).values().filter(|k| k.is_live()).cloned().collect())
}

pub fn create_kernel(store: &MemoryStore, new: NewKernel) -> Result<Kernel, StoreError> {
    let mut kernels = lock(&store.kernels);

    if kernels.values().any(|k| k.is_live() && k.name == new.name) {
        return Err(StoreError::Conflict(format!("Kernel {} already exists", new.name)));
    }

    let now = Utc::now();
    let kernel = Kernel {
        id: store.next_id(),
        name: new.name,
        version: new.version,
        arch: new.arch,
        vmlinuz: new.vmlinuz,
        initramfs: new.initramfs,
        modloop: new.modloop,
        iso: new.iso,
        repo: new.repo,
        archive: new.archive,
        apkovl: new.apkovl,
        rootfs: new.rootfs,
        cmdline: new.cmdline,
        options: new.options,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    kernels.insert(kernel.id, kernel.clone());
    Ok(kernel)
}
