use rand::Rng;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    crypto::SecretCipher,
    db::AdminStore,
    error::ProviderError,
    models::{Provider, ProviderView},
    telemetry,
};

/**
 * \brief 新建 Provider 的输入。
 */
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProvider {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub base_url: String,
    pub api_key: Option<String>,
    pub is_active: Option<bool>,
    pub notes: Option<String>,
}

/**
 * \brief 部分更新；`api_key` 缺省表示保留现有密文。
 */
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPatch {
    pub id: String,
    pub slug: Option<String>,
    pub display_name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub is_active: Option<bool>,
    pub notes: Option<String>,
}

/**
 * \brief 列出 Provider（不含密文）。
 */
pub fn list(store: &AdminStore) -> anyhow::Result<Vec<ProviderView>> {
    Ok(store.load_providers()?.iter().map(ProviderView::from).collect())
}

/**
 * \brief 新建 Provider 并置于列表最前。
 */
pub fn create(
    store: &AdminStore,
    cipher: &SecretCipher,
    input: NewProvider,
) -> Result<Provider, ProviderError> {
    let slug = required(&input.slug, "slug")?;
    let display_name = required(&input.display_name, "displayName")?;
    let base_url = required(&input.base_url, "baseUrl")?;

    let mut list = store.load_providers()?;
    if list.iter().any(|p| p.slug == slug) {
        return Err(ProviderError::DuplicateSlug(slug));
    }
    let provider = Provider {
        id: gen_id(),
        slug,
        display_name,
        base_url,
        api_key_encrypted: encrypt_key(cipher, input.api_key.as_deref())?,
        is_active: input.is_active.unwrap_or(true),
        notes: input.notes,
    };
    list.insert(0, provider.clone());
    store.save_providers(&list)?;
    telemetry::log_event(
        "admin.provider",
        &format!("create id={} slug={}", provider.id, provider.slug),
    );
    Ok(provider)
}

/**
 * \brief 按 ID 部分更新 Provider。
 */
pub fn update(
    store: &AdminStore,
    cipher: &SecretCipher,
    patch: ProviderPatch,
) -> Result<Provider, ProviderError> {
    let mut list = store.load_providers()?;
    let idx = list
        .iter()
        .position(|p| p.id == patch.id)
        .ok_or_else(|| ProviderError::NotFound(patch.id.clone()))?;

    let slug = patch.slug.as_deref().map(|v| required(v, "slug")).transpose()?;
    let display_name = patch
        .display_name
        .as_deref()
        .map(|v| required(v, "displayName"))
        .transpose()?;
    let base_url = patch
        .base_url
        .as_deref()
        .map(|v| required(v, "baseUrl"))
        .transpose()?;
    if let Some(slug) = slug.as_deref() {
        if list.iter().any(|p| p.slug == slug && p.id != patch.id) {
            return Err(ProviderError::DuplicateSlug(slug.to_string()));
        }
    }
    let new_key = encrypt_key(cipher, patch.api_key.as_deref())?;

    let current = &mut list[idx];
    if let Some(slug) = slug {
        current.slug = slug;
    }
    if let Some(display_name) = display_name {
        current.display_name = display_name;
    }
    if let Some(base_url) = base_url {
        current.base_url = base_url;
    }
    if let Some(is_active) = patch.is_active {
        current.is_active = is_active;
    }
    if let Some(notes) = patch.notes {
        current.notes = Some(notes);
    }
    if new_key.is_some() {
        current.api_key_encrypted = new_key;
    }
    let updated = current.clone();
    store.save_providers(&list)?;
    telemetry::log_event(
        "admin.provider",
        &format!("update id={} slug={}", updated.id, updated.slug),
    );
    Ok(updated)
}

/**
 * \brief 删除 Provider；引用该 slug 的目录条目保持不动。
 */
pub fn delete(store: &AdminStore, id: &str) -> Result<(), ProviderError> {
    let list = store.load_providers()?;
    let next: Vec<Provider> = list.into_iter().filter(|p| p.id != id).collect();
    store.save_providers(&next)?;
    telemetry::log_event("admin.provider", &format!("delete id={}", id));
    Ok(())
}

fn required(value: &str, field: &'static str) -> Result<String, ProviderError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ProviderError::MissingField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

fn encrypt_key(cipher: &SecretCipher, key: Option<&str>) -> Result<Option<String>, ProviderError> {
    match key.filter(|k| !k.is_empty()) {
        Some(k) => cipher
            .encrypt(k)
            .map(Some)
            .map_err(|_| ProviderError::Encrypt),
        None => Ok(None),
    }
}

fn gen_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix: u32 = rand::thread_rng().gen_range(0..36u32.pow(6));
    format!("{}-{}", to_base36(millis as u128), to_base36(suffix as u128))
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
