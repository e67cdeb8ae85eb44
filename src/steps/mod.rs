//! Concrete provisioning steps

pub mod env_file;
pub mod packages;
pub mod runtime;
pub mod service;

pub use env_file::CheckEnvFile;
pub use packages::InstallPackageSet;
pub use runtime::EnsureRuntimePresent;
pub use service::{ActivateManagedService, StartManagedService, WriteManagedServiceDefinition};
