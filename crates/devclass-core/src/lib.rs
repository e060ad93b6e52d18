//! Devclass Core - Device class taxonomy and persistent maps
//!
//! This crate provides two independent building blocks:
//! - Device class taxonomy loading from an XML descriptor (basic, generic,
//!   specific, role, node type and device type tables)
//! - A key/value map bound to a backing file, with atomic store/restore and
//!   digest-based change detection

pub mod digest;
pub mod persist;
pub mod taxonomy;

pub use digest::{digest_bytes, digest_file, Digest, DigestAlgorithm};
pub use persist::{PersistError, PersistentMap, StoreRecord};
pub use taxonomy::{ClassRecord, DeviceTaxonomy, GenericClass, TaxonomyError, TaxonomySummary};
