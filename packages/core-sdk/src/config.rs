use std::time::Duration;

use anyhow::{Context, Result};

/**
 * \brief 运行时配置，全部来自环境变量。
 */
#[derive(Debug, Clone)]
pub struct Config {
    /** \brief 部署环境名，用于拼接存储键 */
    pub environment: String,
    /** \brief SQLite 文件路径 */
    pub db_path: String,
    /** \brief base64 编码的 32 字节 AES-256-GCM 密钥 */
    pub encryption_key: Option<String>,
    pub admin_user: Option<String>,
    pub admin_pass: Option<String>,
    /** \brief 生产模式下未配置管理员凭据时拒绝访问 */
    pub production: bool,
    pub upstream_timeout: Duration,
    pub telemetry_enabled: bool,
    pub ui_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: "development".to_string(),
            db_path: "modeldock.db".to_string(),
            encryption_key: None,
            admin_user: None,
            admin_pass: None,
            production: false,
            upstream_timeout: Duration::from_secs(30),
            telemetry_enabled: false,
            ui_dir: "web".to_string(),
        }
    }
}

impl Config {
    /**
     * \brief 从进程环境变量读取配置。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 使用自定义查找函数读取配置，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = non_empty("MODELDOCK_ENV")
            .or_else(|| non_empty("APP_ENV"))
            .unwrap_or(defaults.environment);
        let upstream_timeout = match non_empty("MODELDOCK_UPSTREAM_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid MODELDOCK_UPSTREAM_TIMEOUT_SECS: {}", raw))?,
            ),
            None => defaults.upstream_timeout,
        };

        Ok(Config {
            environment,
            db_path: non_empty("MODELDOCK_DB").unwrap_or(defaults.db_path),
            encryption_key: non_empty("ENCRYPTION_KEY"),
            admin_user: non_empty("ADMIN_BASIC_USER"),
            admin_pass: non_empty("ADMIN_BASIC_PASS"),
            production: non_empty("MODELDOCK_PRODUCTION")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            upstream_timeout,
            telemetry_enabled: non_empty("MODELDOCK_TELEMETRY")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            ui_dir: non_empty("MODELDOCK_UI_DIR").unwrap_or(defaults.ui_dir),
        })
    }

    /**
     * \brief 构建带超时的上游 HTTP 客户端。
     */
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .timeout(self.upstream_timeout)
            .build()?;
        Ok(client)
    }

    /**
     * \brief 流式转发用客户端：只限制建立连接的时间，不截断长响应。
     */
    pub fn streaming_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.upstream_timeout)
            .build()?;
        Ok(client)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
