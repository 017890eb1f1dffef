pub mod bus;
pub mod error;
pub mod latest;

pub use bus::{BusSettings, BusStats, SubscriptionHandle, TopicBus};
pub use error::TopicError;
pub use latest::{CellSnapshot, LatestValueCache};
