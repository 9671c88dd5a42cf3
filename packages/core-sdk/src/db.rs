use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::models::{Catalog, Provider};

/**
 * \brief 字符串键、JSON 值的键值存储。
 */
pub trait KvStore: Send + Sync {
    /** \brief 读取原始 JSON 文本，不存在返回 None。 */
    fn get_raw(&self, key: &str) -> Result<Option<String>>;
    /** \brief 整体覆盖写入。 */
    fn set_raw(&self, key: &str, value: &str) -> Result<()>;
}

/**
 * \brief 基于 SQLite 的键值存储。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开（或创建）数据库文件并执行迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open database {}", path.as_ref().display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection poisoned"))?;
        f(&guard)
    }
}

impl KvStore for SqliteStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key=?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    params![key, value],
                )
            })?;
            Ok(())
        })
    }
}

/**
 * \brief 进程内键值存储，供测试替换使用。
 */
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let map = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS kv (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

pub fn providers_key(environment: &str) -> String {
    format!("admin:providers:{}", environment)
}

pub fn models_key(environment: &str) -> String {
    format!("admin:models:{}", environment)
}

/**
 * \brief 按部署环境划分的 Provider / 目录存储，注入到每个核心操作中。
 * \details 每次调用都重新读取，写入为整文档覆盖。
 */
#[derive(Clone)]
pub struct AdminStore {
    kv: Arc<dyn KvStore>,
    environment: String,
}

impl AdminStore {
    pub fn new(kv: Arc<dyn KvStore>, environment: impl Into<String>) -> Self {
        AdminStore {
            kv,
            environment: environment.into(),
        }
    }

    /**
     * \brief 使用内存存储构建，便于测试。
     */
    pub fn in_memory(environment: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), environment)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /**
     * \brief 读取 Provider 列表，未存储时为空。
     */
    pub fn load_providers(&self) -> Result<Vec<Provider>> {
        Ok(self
            .get_json(&providers_key(&self.environment))?
            .unwrap_or_default())
    }

    pub fn save_providers(&self, providers: &[Provider]) -> Result<()> {
        self.set_json(&providers_key(&self.environment), providers)
    }

    /**
     * \brief 读取模型目录，未存储时为空目录。
     */
    pub fn load_catalog(&self) -> Result<Catalog> {
        Ok(self
            .get_json(&models_key(&self.environment))?
            .unwrap_or_default())
    }

    pub fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        self.set_json(&models_key(&self.environment), catalog)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.kv.get_raw(key)? else {
            return Ok(None);
        };
        if raw.trim() == "null" {
            return Ok(None);
        }
        let value = serde_json::from_str(&raw).with_context(|| format!("decode {}", key))?;
        Ok(Some(value))
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.set_raw(key, &raw)
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogDefaults, ModelEntry};

    fn provider(slug: &str) -> Provider {
        Provider {
            id: format!("id-{}", slug),
            slug: slug.to_string(),
            display_name: slug.to_uppercase(),
            base_url: "https://api.example.com/v1".to_string(),
            api_key_encrypted: Some("PLAINTEXT:sk".to_string()),
            is_active: true,
            notes: None,
        }
    }

    #[test]
    fn test_sqlite_roundtrip_and_overwrite() {
        let kv = SqliteStore::open_in_memory().expect("open in-memory db");
        assert_eq!(kv.get_raw("k").expect("get"), None);
        kv.set_raw("k", "[1]").expect("set");
        kv.set_raw("k", "[2]").expect("overwrite");
        assert_eq!(kv.get_raw("k").expect("get").as_deref(), Some("[2]"));
    }

    #[test]
    fn test_sqlite_file_persists_between_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("modeldock.db");
        {
            let store = AdminStore::new(Arc::new(SqliteStore::open(&path).expect("open")), "test");
            store
                .save_providers(&[provider("openai")])
                .expect("save providers");
        }
        let store = AdminStore::new(Arc::new(SqliteStore::open(&path).expect("reopen")), "test");
        let list = store.load_providers().expect("load providers");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].slug, "openai");
    }

    #[test]
    fn test_keys_are_scoped_by_environment() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let dev = AdminStore::new(kv.clone(), "development");
        let prod = AdminStore::new(kv.clone(), "production");
        dev.save_providers(&[provider("openai")]).expect("save");
        assert!(prod.load_providers().expect("load").is_empty());
        assert!(kv
            .get_raw("admin:providers:development")
            .expect("get")
            .is_some());
    }

    #[test]
    fn test_missing_catalog_is_empty() {
        let store = AdminStore::in_memory("test");
        let catalog = store.load_catalog().expect("load");
        assert!(catalog.models.is_empty());
        assert_eq!(catalog.defaults, CatalogDefaults::default());
    }

    #[test]
    fn test_catalog_roundtrip() {
        let store = AdminStore::in_memory("test");
        let catalog = Catalog {
            models: vec![ModelEntry {
                provider: "openai".into(),
                value: "gpt-4o".into(),
                label: "GPT-4o".into(),
                enabled: Some(false),
                sort: 3,
                description: String::new(),
            }],
            defaults: CatalogDefaults {
                model: Some("gpt-4o".into()),
                temperature: Some(0.7),
                max_tokens: None,
            },
        };
        store.save_catalog(&catalog).expect("save");
        assert_eq!(store.load_catalog().expect("load"), catalog);
    }

    #[test]
    fn test_corrupt_document_is_error() {
        let kv = Arc::new(MemoryStore::new());
        kv.set_raw("admin:models:test", "{not json").expect("set");
        let store = AdminStore::new(kv, "test");
        assert!(store.load_catalog().is_err());
    }
}
