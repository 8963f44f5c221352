pub mod client;
pub mod confirm;
pub mod error;
pub mod lock;
mod macros;
pub mod origins;
pub mod preflight;
pub mod publications;
pub mod reverse;
pub mod rewind;
pub mod slots;
pub mod subscriptions;
pub mod tables;
