pub mod catalog;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod models;
pub mod providers;
pub mod server;
pub mod sync;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::catalog;
    pub use crate::config::Config;
    pub use crate::crypto::SecretCipher;
    pub use crate::db::{self, AdminStore};
    pub use crate::dispatch;
    pub use crate::error::{CatalogError, DecryptError, DispatchError, ProviderError, SyncError};
    pub use crate::llm;
    pub use crate::models;
    pub use crate::providers;
    pub use crate::server;
    pub use crate::sync;
    pub use crate::telemetry;
}
