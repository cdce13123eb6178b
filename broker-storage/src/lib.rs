//! Persistent, encrypted broker state.
//!
//! [`Storage`] wraps a SQLite pool and an [`Encryptor`]. Every blob column
//! (workspaces, instance outputs, request parameters) passes through the
//! encryptor on the way in and out; a failure on either side is returned,
//! never papered over with an empty value.

pub mod db;
pub mod deployments;
pub mod encryption;
pub mod error;
pub mod instances;
pub mod operation;
pub mod password_metadata;
pub mod provision_requests;
mod rotation;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use deployments::TerraformDeployment;
pub use encryption::{EncryptionError, Encryptor, GcmEncryptor, NoopEncryptor};
pub use error::{CodecError, Result, StorageError};
pub use instances::ServiceInstanceDetails;
pub use operation::{OperationState, OperationType};
pub use password_metadata::{setup_encryptor, EncryptionPassword, PasswordMetadata};
pub use storage::Storage;
