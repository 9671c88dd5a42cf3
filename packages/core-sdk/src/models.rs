use std::fmt;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/**
 * \brief 上游 Provider 配置（OpenAI 兼容接口 + 凭据）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /** \brief 创建时分配的不可变 ID */
    pub id: String,
    /** \brief 唯一短标识，作为组合模型 ID 的前缀 */
    pub slug: String,
    /** \brief 显示名称 */
    pub display_name: String,
    /** \brief API 基地址（使用前去除末尾斜杠） */
    pub base_url: String,
    /** \brief 加密后的 API Key，仅在解密边界内使用 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_encrypted: Option<String>,
    /** \brief 是否参与同步与对话分发；缺省视为启用 */
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Provider {
    /**
     * \brief 去除末尾斜杠后的基地址。
     */
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/**
 * \brief 对外展示用的 Provider（不含密文）。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderView {
    pub id: String,
    pub slug: String,
    pub display_name: String,
    pub base_url: String,
    pub is_active: bool,
    pub has_api_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl From<&Provider> for ProviderView {
    fn from(p: &Provider) -> Self {
        ProviderView {
            id: p.id.clone(),
            slug: p.slug.clone(),
            display_name: p.display_name.clone(),
            base_url: p.base_url.clone(),
            is_active: p.is_active,
            has_api_key: p.api_key_encrypted.is_some(),
            notes: p.notes.clone(),
        }
    }
}

/**
 * \brief 目录条目的复合键 `(provider slug, value)`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub provider: String,
    pub value: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, value: impl Into<String>) -> Self {
        ModelKey {
            provider: provider.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.value)
    }
}

/**
 * \brief 模型目录中的一条记录，管理员可编辑 label / enabled / sort / description。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /** \brief 所属 Provider 的 slug */
    pub provider: String,
    /** \brief 上游模型 ID */
    pub value: String,
    #[serde(default)]
    pub label: String,
    /** \brief 缺失时列表视为可见，但同步时按未启用继承；新发现的模型显式写入 false */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub sort: i64,
    #[serde(default)]
    pub description: String,
}

impl ModelEntry {
    /**
     * \brief 是否对外可见：只有显式 `false` 才算禁用。
     */
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }

    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.provider.clone(), self.value.clone())
    }

    /**
     * \brief 组合模型 ID：`<provider>:<value>`。
     */
    pub fn composite_id(&self) -> String {
        self.key().to_string()
    }

    /**
     * \brief 展示名称，label 为空时回退为 value。
     */
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.value
        } else {
            &self.label
        }
    }
}

/**
 * \brief 目录默认参数。`model` 存储的是裸 value 而非组合 ID。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/**
 * \brief 某一部署环境下的完整模型目录。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub defaults: CatalogDefaults,
}

/**
 * \brief 面向聊天端的模型投影。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicModel {
    /** \brief 组合 ID */
    pub id: String,
    pub label: String,
    pub provider: String,
    pub value: String,
    pub sort: i64,
}

/**
 * \brief 分发解析结果：可直接用于调用上游 chat/completions。
 */
#[derive(Clone, PartialEq)]
pub struct DispatchTarget {
    pub provider_slug: String,
    /** \brief 已去除末尾斜杠 */
    pub base_url: String,
    pub api_key: String,
    pub upstream_model_id: String,
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTarget")
            .field("provider_slug", &self.provider_slug)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("upstream_model_id", &self.upstream_model_id)
            .finish()
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}
