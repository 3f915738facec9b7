//! Lease operations for MemoryStore

use super::{lock, sorted, MemoryStore};
use crate::error::StoreError;
use crate::models::*;
use chrono::Utc;

pub fn get_lease(store: &MemoryStore, id: u64) -> Result<Lease, StoreError> {
    lock(&store.leases)
        .get(&id)
        .filter(|l| l.is_live())
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("Lease {} not found", id)))
}

pub fn find_lease(store: &MemoryStore, predicate: impl Fn(&Lease) -> bool) -> Option<Lease> {
    let leases = lock(&store.leases);
    let mut matches: Vec<&Lease> = leases.values().filter(|&l| l.is_live() && predicate(l)).collect();
    matches.sort_by_key(|l| l.id);
    matches.first().map(|l| (*l).clone())
}

pub fn list_leases(store: &MemoryStore) -> Vec<Lease> {
    sorted(lock(&store.leases).values().filter(|l| l.is_live()).cloned().collect())
}

fn check_unique<'a>(
    mut live: impl Iterator<Item = &'a Lease>,
    id: Option<u64>,
    ip: std::net::Ipv4Addr,
    mac: &MacAddress,
) -> Result<(), StoreError> {
    live.try_for_each(|l| {
        if Some(l.id) == id {
            Ok(())
        } else if l.ip == ip {
            Err(StoreError::Conflict(format!("Lease for IP {} already exists", ip)))
        } else if &l.mac == mac {
            Err(StoreError::Conflict(format!("Lease for MAC {} already exists", mac)))
        } else {
            Ok(())
        }
    })
}

pub fn create_lease(store: &MemoryStore, new: NewLease) -> Result<Lease, StoreError> {
    let mut leases = lock(&store.leases);
    check_unique(leases.values().filter(|l| l.is_live()), None, new.ip, &new.mac)?;

    let now = Utc::now();
    let lease = Lease {
        id: store.next_id(),
        ip: new.ip,
        mac: new.mac,
        node: new.node,
        next_server: new.next_server,
        tftp_server: new.tftp_server,
        boot_file: new.boot_file,
        netmask: new.netmask,
        lease_time: new.lease_time,
        discover_time: None,
        request_time: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    leases.insert(lease.id, lease.clone());
    Ok(lease)
}

pub fn update_lease(store: &MemoryStore, lease: &Lease) -> Result<Lease, StoreError> {
    let mut leases = lock(&store.leases);

    match leases.get(&lease.id) {
        Some(existing) if existing.is_live() => {}
        _ => return Err(StoreError::NotFound(format!("Lease {} not found", lease.id))),
    }
    check_unique(leases.values().filter(|l| l.is_live()), Some(lease.id), lease.ip, &lease.mac)?;

    let mut updated = lease.clone();
    updated.updated_at = Utc::now();
    updated.deleted_at = None;
    leases.insert(updated.id, updated.clone());
    Ok(updated)
}

pub fn delete_lease(store: &MemoryStore, id: u64) -> Result<(), StoreError> {
    let mut leases = lock(&store.leases);
    match leases.get_mut(&id) {
        Some(lease) if lease.is_live() => {
            lease.deleted_at = Some(Utc::now());
            Ok(())
        }
        _ => Err(StoreError::NotFound(format!("Lease {} not found", id))),
    }
}
