//! Durable per-user sessions backed by SQLite with a write-through cache.

mod error;
pub mod model;
mod store;

pub use error::StoreError;
pub use model::{
    Adapter, ClusterAccess, ClusterNode, GrafanaConfig, PrometheusConfig, SelectedBoardConfig,
    Session,
};
pub use store::SessionStore;
