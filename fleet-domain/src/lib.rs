pub mod assignment;
pub mod clock;
pub mod container;
pub mod error;
pub mod logging;
pub mod manufacturing;
pub mod market;
pub mod model;
pub mod supply_chain;

#[cfg(feature = "test-utils")]
pub mod test_fixtures;

pub use assignment::*;
pub use clock::*;
pub use container::*;
pub use error::*;
pub use logging::*;
pub use manufacturing::*;
pub use market::*;
pub use model::*;
pub use supply_chain::*;
