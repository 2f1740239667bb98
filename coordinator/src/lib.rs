//! Registry service internals, exposed for the binary and tests.

pub mod service;
pub mod state;

pub use service::RegistryService;
pub use state::RegistryState;
