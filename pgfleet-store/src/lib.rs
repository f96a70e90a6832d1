//! Connection management and schema bootstrap for the two PostgreSQL stores
//! pgfleet talks to: the configuration store (schema `pgwatch3`) and the
//! metric store (schema `admin` plus one table per metric under `public`).

pub mod bootstrap;
mod error;
pub mod ident;
pub mod pool;
pub mod schema_type;

pub use error::StoreError;
pub use pool::{connect_config_store, connect_metric_store, open_pool, Pool};
pub use schema_type::{read_schema_type, StorageSchemaType};
