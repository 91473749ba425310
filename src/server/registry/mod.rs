pub mod credentials;
pub mod reference;

pub use credentials::{CredentialStore, CredentialsProvider};
pub use reference::credential_host;
