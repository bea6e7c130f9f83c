//! # provision
//!
//! Concrete provisioning steps for database-appliance clusters and the
//! per-profile step tables that select them.
//!
//! Each step splits its work into ledger-tracked sub-steps and only touches
//! hosts listed in the cluster context. Commands go through the installer
//! stages and host utilities defined in [`commands`].
//!
//! ## Example
//!
//! ```ignore
//! let registry = provision::registry()?;
//! let table = registry.table(stepflow::Profile::Standard)?;
//! for entry in table.entries() {
//!     println!("{:>2} {:<28} {}", entry.position, entry.kind, entry.description);
//! }
//! ```

pub mod catalog;
pub mod commands;
pub mod steps;

pub use catalog::registry;
