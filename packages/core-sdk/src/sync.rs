use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::{
    crypto::SecretCipher,
    db::AdminStore,
    error::SyncError,
    llm,
    models::{Catalog, ModelEntry, ModelKey, Provider},
    telemetry,
};

/**
 * \brief 单个 Provider 被跳过的原因。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SkipReason {
    /** \brief 未配置 Key 或解密结果为空 */
    MissingApiKey,
    Decrypt(String),
    /** \brief 上游请求失败、非成功状态或响应不可解析 */
    Upstream(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingApiKey => write!(f, "missing api key"),
            SkipReason::Decrypt(e) => write!(f, "decrypt failed: {}", e),
            SkipReason::Upstream(e) => write!(f, "upstream failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedProvider {
    pub slug: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncedProvider {
    pub slug: String,
    /** \brief 本轮上游返回的模型数量 */
    pub discovered: usize,
}

/**
 * \brief 同步结果：目录总数以及每个 Provider 的去向。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub total_models: usize,
    pub synced: Vec<SyncedProvider>,
    pub skipped: Vec<SkippedProvider>,
}

/**
 * \brief 保持插入顺序、按 `(provider, value)` 去重的合并表。
 */
#[derive(Debug, Default)]
pub struct MergeMap {
    entries: Vec<ModelEntry>,
    index: HashMap<ModelKey, usize>,
}

impl MergeMap {
    /**
     * \brief 以既有目录为种子。若存储中出现重复键，后出现者覆盖先出现者，位置保持不变。
     */
    pub fn seeded(models: Vec<ModelEntry>) -> Self {
        let mut map = MergeMap::default();
        for entry in models {
            map.insert(entry);
        }
        map
    }

    pub fn get(&self, key: &ModelKey) -> Option<&ModelEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /**
     * \brief 合并候选条目：已有非空 label 保留，其余字段取候选值。
     */
    pub fn merge(&mut self, candidate: ModelEntry) {
        let key = candidate.key();
        match self.index.get(&key) {
            Some(&i) => {
                let prior = &mut self.entries[i];
                let label = if prior.label.is_empty() {
                    candidate.label
                } else {
                    std::mem::take(&mut prior.label)
                };
                *prior = ModelEntry {
                    label,
                    ..candidate
                };
            }
            None => self.insert(candidate),
        }
    }

    fn insert(&mut self, entry: ModelEntry) {
        let key = entry.key();
        match self.index.get(&key) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn into_models(self) -> Vec<ModelEntry> {
        self.entries
    }
}

/**
 * \brief 由上游模型 ID 构造候选条目，enabled/sort/description 从 carry-over 继承。
 */
pub fn build_candidate(
    slug: &str,
    upstream_id: &str,
    carry_over: &HashMap<ModelKey, ModelEntry>,
) -> ModelEntry {
    let prev = carry_over.get(&ModelKey::new(slug, upstream_id));
    ModelEntry {
        provider: slug.to_string(),
        value: upstream_id.to_string(),
        label: upstream_id.to_string(),
        enabled: Some(prev.and_then(|m| m.enabled).unwrap_or(false)),
        sort: prev.map(|m| m.sort).unwrap_or(0),
        description: prev.map(|m| m.description.clone()).unwrap_or_default(),
    }
}

/**
 * \brief 将一个 Provider 本轮发现的模型合并进目录，纯函数，不涉及 I/O。
 * \details 上游不再返回的模型不会被删除；同一响应内的重复 ID 以后出现者为准。
 */
pub fn merge_discovered(
    merged: &mut MergeMap,
    carry_over: &HashMap<ModelKey, ModelEntry>,
    slug: &str,
    upstream_ids: &[String],
) {
    for id in upstream_ids {
        merged.merge(build_candidate(slug, id, carry_over));
    }
}

/**
 * \brief 选出本次需要同步的 Provider：显式指定 slug 时不过滤启用状态。
 */
pub fn select_targets<'a>(providers: &'a [Provider], target_slug: Option<&str>) -> Vec<&'a Provider> {
    match target_slug {
        Some(slug) => providers.iter().filter(|p| p.slug == slug).collect(),
        None => providers.iter().filter(|p| p.is_active).collect(),
    }
}

/**
 * \brief 从上游同步模型列表并合并进目录。
 * \param target_slug 仅同步该 Provider；为空时同步全部启用的 Provider。
 * \details Provider 按列表顺序串行处理；单个 Provider 失败只记入 `skipped`，不会中断整体同步。
 *          目录在全部处理完成后一次性写回。
 */
pub async fn sync(
    store: &AdminStore,
    cipher: &SecretCipher,
    client: &reqwest::Client,
    target_slug: Option<&str>,
) -> Result<SyncReport, SyncError> {
    let providers = store.load_providers()?;
    let targets = select_targets(&providers, target_slug);
    if targets.is_empty() {
        return Err(SyncError::NoProviders);
    }

    let Catalog { models, defaults } = store.load_catalog()?;
    let carry_over: HashMap<ModelKey, ModelEntry> =
        models.iter().map(|m| (m.key(), m.clone())).collect();
    let mut merged = MergeMap::seeded(models);

    let mut synced = Vec::new();
    let mut skipped = Vec::new();
    for provider in targets {
        match fetch_provider_models(cipher, client, provider).await {
            Ok(ids) => {
                merge_discovered(&mut merged, &carry_over, &provider.slug, &ids);
                synced.push(SyncedProvider {
                    slug: provider.slug.clone(),
                    discovered: ids.len(),
                });
            }
            Err(reason) => {
                telemetry::log_event(
                    "sync",
                    &format!("skip provider={} reason={}", provider.slug, reason),
                );
                skipped.push(SkippedProvider {
                    slug: provider.slug.clone(),
                    reason,
                });
            }
        }
    }

    let catalog = Catalog {
        models: merged.into_models(),
        defaults,
    };
    store.save_catalog(&catalog)?;

    telemetry::log_event(
        "sync",
        &format!(
            "done total={} synced={} skipped={}",
            catalog.models.len(),
            synced.len(),
            skipped.len()
        ),
    );
    Ok(SyncReport {
        total_models: catalog.models.len(),
        synced,
        skipped,
    })
}

async fn fetch_provider_models(
    cipher: &SecretCipher,
    client: &reqwest::Client,
    provider: &Provider,
) -> Result<Vec<String>, SkipReason> {
    let encrypted = provider
        .api_key_encrypted
        .as_deref()
        .ok_or(SkipReason::MissingApiKey)?;
    let api_key = cipher
        .decrypt(encrypted)
        .map_err(|e| SkipReason::Decrypt(e.to_string()))?;
    if api_key.is_empty() {
        return Err(SkipReason::MissingApiKey);
    }
    llm::list_models(client, provider.trimmed_base_url(), &api_key)
        .await
        .map_err(|e| SkipReason::Upstream(e.to_string()))
}
