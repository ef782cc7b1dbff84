//! Security domain module
//!
//! Principals and the row-level policy seam the searcher reconciles hits
//! against.
//!
//! # Architecture
//!
//! - **Entities**: `Principal`
//! - **Traits**: `SecurityPolicyStore` (has-policies check + secured reload by id)
//! - **Implementations**: `InMemoryPolicyStore` here, `SqlPolicyStore` in
//!   `infrastructure::sql`

pub mod policy;
pub mod principal;

pub use policy::{InMemoryPolicyStore, RowPredicate, SecurityPolicyStore};
pub use principal::Principal;
