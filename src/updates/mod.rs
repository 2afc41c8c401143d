//! Container update pipeline: digest checks, policy guardrails and the
//! recreate-with-rollback executor

mod checker;
mod executor;
mod labels;
mod policy;
mod tracker;

pub use checker::{HttpRegistryClient, RegistryClient, UpdateChecker};
pub use executor::{RegistryCredentialsFn, UpdateExecutor, UpdateOptions, UpdateResult};
pub use labels::{extract_user_labels, preserved_labels};
pub use policy::{glob_match, is_self_image, validate_batch, BatchValidation, UpdateCandidate};
pub use tracker::UpdatingContainers;
