//! Netboot Repository
//!
//! Entity models and storage for the netboot provisioning pipeline.
//!
//! # Example
//!
//! ```no_run
//! use netboot_store::{MemoryStore, NewKernel, Repository};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//!
//! let kernel = store.create_kernel(NewKernel {
//!     name: "alpine".to_string(),
//!     version: "3.14.0".to_string(),
//!     vmlinuz: "/alpine/netboot/3.14.0/vmlinuz-lts".to_string(),
//!     initramfs: "/alpine/netboot/3.14.0/initramfs-lts".to_string(),
//!     archive: Some("https://dl-cdn.alpinelinux.org".to_string()),
//!     ..Default::default()
//! }).await?;
//!
//! let found = store.find_kernel_by_name("alpine").await?;
//! assert_eq!(found.map(|k| k.id), Some(kernel.id));
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Soft deletes**: deleted rows keep their history but vanish from queries
//! - **Uniqueness**: one live lease per IP and per MAC, one live node per IP
//! - **Snapshots**: optional JSON persistence of the whole store

pub mod error;
pub mod memory;
pub mod models;
#[path = "trait.rs"]
pub mod repository_trait;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::*;
pub use repository_trait::Repository;
