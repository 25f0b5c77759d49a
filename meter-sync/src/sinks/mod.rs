pub mod batch;
pub mod day_file;
pub mod memory;
pub mod store;

pub use batch::{BatchLoader, BatchWriter, LoadStats};
pub use day_file::DayFileAppender;
pub use memory::MemoryStore;
pub use store::{CentralStore, PgStore, StoreError};
