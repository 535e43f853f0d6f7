pub mod index;
pub mod log;
pub mod store;

pub use log::{FetchItem, Partition, StartPoint};
pub use store::MessageStore;
