//! Erasure Core
//!
//! Shared vocabulary for the account-deletion compliance endpoint: domain
//! types, the error enum, the collaborator traits (`DedupStore`,
//! `DeletionPipeline`) and the challenge digest.

pub mod digest;
pub mod error;
pub mod traits;
pub mod types;

pub use digest::*;
pub use error::*;
pub use traits::*;
pub use types::*;
