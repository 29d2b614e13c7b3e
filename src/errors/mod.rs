pub mod provider_error;

pub use provider_error::{ErrorKind, ProviderError, ProviderResult};
