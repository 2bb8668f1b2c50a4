mod driver;
mod error;
mod filesystem;
mod memory;
mod registry;
mod shared;
mod sqlite;
mod url;
mod wake;

pub use driver::{epoch, wait_time, Driver, SendOptions, When};
pub use error::{DriverError, Result};
pub use filesystem::{FileSystemDriver, FsConfig};
pub use memory::{MemoryConfig, MemoryDriver, MemoryQueue};
pub use registry::connect;
pub use shared::SharedCache;
pub use sqlite::{DeadMode, SqliteConfig, SqliteDriver};
pub use url::BackendUrl;
pub use wake::Wake;
