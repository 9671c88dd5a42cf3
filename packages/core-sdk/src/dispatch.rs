use crate::{
    crypto::SecretCipher,
    db::AdminStore,
    error::DispatchError,
    models::{DispatchTarget, Provider},
};

/**
 * \brief 按第一个 `:` 拆分组合模型 ID，两段都不能为空。
 */
pub fn split_model_id(composite: &str) -> Result<(&str, &str), DispatchError> {
    match composite.split_once(':') {
        Some((slug, model)) if !slug.is_empty() && !model.is_empty() => Ok((slug, model)),
        _ => Err(DispatchError::MalformedModelId(composite.to_string())),
    }
}

/**
 * \brief 在给定 Provider 列表上解析组合模型 ID，不读写存储。
 */
pub fn resolve_with(
    providers: &[Provider],
    cipher: &SecretCipher,
    composite: &str,
) -> Result<DispatchTarget, DispatchError> {
    let (slug, upstream_model_id) = split_model_id(composite)?;
    let provider = providers
        .iter()
        .find(|p| p.slug == slug && p.is_active)
        .ok_or_else(|| DispatchError::ModelNotFound(slug.to_string()))?;
    let api_key = cipher
        .usable_key(provider.api_key_encrypted.as_deref())
        .ok_or_else(|| DispatchError::InvalidApiKey(slug.to_string()))?;
    Ok(DispatchTarget {
        provider_slug: provider.slug.clone(),
        base_url: provider.trimmed_base_url().to_string(),
        api_key,
        upstream_model_id: upstream_model_id.to_string(),
    })
}

/**
 * \brief 将 `<provider>:<model>` 解析为上游地址、明文 Key 与上游模型 ID。
 * \details 无副作用，每次调用都重新读取 Provider 列表。
 */
pub fn resolve(
    store: &AdminStore,
    cipher: &SecretCipher,
    composite: &str,
) -> Result<DispatchTarget, DispatchError> {
    split_model_id(composite)?;
    let providers = store.load_providers()?;
    resolve_with(&providers, cipher, composite)
}
