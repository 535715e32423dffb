mod context;
pub mod persist;
mod policy;
mod store;

pub use context::TrustContext;
pub use policy::{AutoAcceptPolicy, ConfirmPolicy, Prompt, StdinPrompt, TrustDecision, TrustPolicy};
pub use store::{fingerprint, lookup_name, KeyEntry, KeyMatch, TrustStore};
