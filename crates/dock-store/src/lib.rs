pub mod buffers;
pub mod error;
pub mod gateways;
pub mod layout;
pub mod ledger;
pub mod schema;
pub mod shipments;
pub mod store;

pub use buffers::BufferUpdate;
pub use error::{Result, StoreError};
pub use layout::{DataDir, default_base_dir};
pub use store::Store;
