//! Rate limiting algorithms and the limiter facade.

mod codec;
pub mod gcra;
mod key;
mod limit;
mod limiter;
pub mod policy;
pub mod sliding_window;

pub use gcra::Gcra;
pub use key::{StoreKey, DEFAULT_PREFIX};
pub use limit::{Algorithm, Decision, Limit};
pub use limiter::Limiter;
pub use policy::{PolicyRule, PolicySet, TimeUnit};
pub use sliding_window::SlidingWindow;
