//! Process-wide domain values shared by every layer.
//!
//! - [`ThreadKey`] addresses one conversation thread across backends.
//! - [`PlatformConstraints`] describes what the embedding platform can do.
//!   It is injected into the components that need it, never read from a global.

mod platform;
mod thread;

pub use platform::PlatformConstraints;
pub use thread::ThreadKey;
