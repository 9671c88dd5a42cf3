use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    db::AdminStore,
    error::CatalogError,
    models::{Catalog, CatalogDefaults, ModelEntry, ModelKey, PublicModel},
};

/**
 * \brief 管理视图：返回原始目录，`include_disabled` 为 false 时只保留启用条目。
 */
pub fn list_models(store: &AdminStore, include_disabled: bool) -> anyhow::Result<Vec<ModelEntry>> {
    let catalog = store.load_catalog()?;
    Ok(if include_disabled {
        catalog.models
    } else {
        enabled_only(catalog.models)
    })
}

pub fn enabled_only(models: Vec<ModelEntry>) -> Vec<ModelEntry> {
    models.into_iter().filter(ModelEntry::is_enabled).collect()
}

/**
 * \brief 将启用条目投影为公开模型，按 sort 升序、label 字典序升序排列。
 */
pub fn project_public(models: &[ModelEntry]) -> Vec<PublicModel> {
    let mut list: Vec<PublicModel> = models
        .iter()
        .filter(|m| m.is_enabled())
        .map(|m| PublicModel {
            id: m.composite_id(),
            label: m.display_label().to_string(),
            provider: m.provider.clone(),
            value: m.value.clone(),
            sort: m.sort,
        })
        .collect();
    list.sort_by(|a, b| {
        a.sort
            .cmp(&b.sort)
            .then_with(|| a.label.cmp(&b.label))
            .then_with(|| a.id.cmp(&b.id))
    });
    list
}

/**
 * \brief 公开视图。
 */
pub fn list_public_models(store: &AdminStore) -> anyhow::Result<Vec<PublicModel>> {
    let catalog = store.load_catalog()?;
    Ok(project_public(&catalog.models))
}

/**
 * \brief 将存储的裸 value 默认模型映射为当前的组合 ID；找不到时返回 None。
 */
pub fn resolve_default_model(
    defaults: &CatalogDefaults,
    enabled_public: &[PublicModel],
) -> Option<String> {
    let wanted = defaults.model.as_deref()?;
    enabled_public
        .iter()
        .find(|m| m.value == wanted)
        .map(|m| m.id.clone())
}

/**
 * \brief 聊天端看到的默认参数，`model` 已是组合 ID。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublicCatalog {
    pub models: Vec<PublicModel>,
    pub defaults: PublicDefaults,
}

/**
 * \brief 公开模型列表与重新解析后的默认参数。
 */
pub fn public_catalog(store: &AdminStore) -> anyhow::Result<PublicCatalog> {
    let catalog = store.load_catalog()?;
    let models = project_public(&catalog.models);
    let defaults = PublicDefaults {
        model: resolve_default_model(&catalog.defaults, &models),
        temperature: catalog.defaults.temperature,
        max_tokens: catalog.defaults.max_tokens,
    };
    Ok(PublicCatalog { models, defaults })
}

/**
 * \brief 管理员整体替换目录；要求每条都有 provider/value 且复合键唯一。
 */
pub fn replace_catalog(store: &AdminStore, catalog: Catalog) -> Result<(), CatalogError> {
    validate(&catalog.models)?;
    store.save_catalog(&catalog)?;
    Ok(())
}

fn validate(models: &[ModelEntry]) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    for (idx, m) in models.iter().enumerate() {
        if m.provider.trim().is_empty() || m.value.trim().is_empty() {
            return Err(CatalogError::EmptyIdentity(idx));
        }
        if !seen.insert(m.key()) {
            return Err(CatalogError::DuplicateModel(m.composite_id()));
        }
    }
    Ok(())
}

/**
 * \brief 单条目编辑，未给出的字段保持不变。
 */
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPatch {
    pub label: Option<String>,
    pub enabled: Option<bool>,
    pub sort: Option<i64>,
    pub description: Option<String>,
}

/**
 * \brief 修改单个目录条目（不触发任何上游调用）。
 */
pub fn update_model(
    store: &AdminStore,
    key: &ModelKey,
    patch: ModelPatch,
) -> Result<ModelEntry, CatalogError> {
    let mut catalog = store.load_catalog()?;
    let entry = catalog
        .models
        .iter_mut()
        .find(|m| m.provider == key.provider && m.value == key.value)
        .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;
    if let Some(label) = patch.label {
        entry.label = label;
    }
    if let Some(enabled) = patch.enabled {
        entry.enabled = Some(enabled);
    }
    if let Some(sort) = patch.sort {
        entry.sort = sort;
    }
    if let Some(description) = patch.description {
        entry.description = description;
    }
    let updated = entry.clone();
    store.save_catalog(&catalog)?;
    Ok(updated)
}

/**
 * \brief 更新默认参数，`model` 仍以裸 value 存储。
 */
pub fn set_defaults(store: &AdminStore, defaults: CatalogDefaults) -> anyhow::Result<()> {
    let mut catalog = store.load_catalog()?;
    catalog.defaults = defaults;
    store.save_catalog(&catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, value: &str, label: &str, enabled: bool, sort: i64) -> ModelEntry {
        ModelEntry {
            provider: provider.into(),
            value: value.into(),
            label: label.into(),
            enabled: Some(enabled),
            sort,
            description: String::new(),
        }
    }

    fn seeded(models: Vec<ModelEntry>, default_model: Option<&str>) -> AdminStore {
        let store = AdminStore::in_memory("test");
        store
            .save_catalog(&Catalog {
                models,
                defaults: CatalogDefaults {
                    model: default_model.map(str::to_string),
                    temperature: Some(0.5),
                    max_tokens: Some(256),
                },
            })
            .expect("seed catalog");
        store
    }

    #[test]
    fn test_list_models_filters_disabled() {
        let store = seeded(
            vec![
                entry("a", "on", "", true, 0),
                entry("a", "off", "", false, 0),
            ],
            None,
        );
        assert_eq!(list_models(&store, true).expect("all").len(), 2);
        let enabled = list_models(&store, false).expect("enabled");
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].value, "on");
    }

    #[test]
    fn test_public_ordering_sort_then_label() {
        let models = vec![
            entry("a", "z", "Zeta", true, 1),
            entry("b", "y", "Alpha", true, 1),
            entry("c", "x", "Mid", true, 0),
            entry("d", "w", "", true, 0),
            entry("e", "hidden", "AAA", false, -5),
        ];
        let ids: Vec<String> = project_public(&models).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c:x", "d:w", "b:y", "a:z"]);

        let mut reversed = models.clone();
        reversed.reverse();
        let again: Vec<String> = project_public(&reversed).into_iter().map(|m| m.id).collect();
        assert_eq!(again, ids);
    }

    #[test]
    fn test_public_label_falls_back_to_value() {
        let public = project_public(&[entry("openai", "gpt-4o", "", true, 0)]);
        assert_eq!(public[0].label, "gpt-4o");
        assert_eq!(public[0].id, "openai:gpt-4o");
    }

    #[test]
    fn test_resolve_default_model() {
        let public = project_public(&[
            entry("openai", "gpt-4o", "", true, 0),
            entry("openai", "o1", "", false, 0),
        ]);
        let defaults = |m: &str| CatalogDefaults {
            model: Some(m.into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_default_model(&defaults("gpt-4o"), &public).as_deref(),
            Some("openai:gpt-4o")
        );
        assert_eq!(resolve_default_model(&defaults("o1"), &public), None);
        assert_eq!(
            resolve_default_model(&CatalogDefaults::default(), &public),
            None
        );
    }

    #[test]
    fn test_public_catalog_resolves_defaults() {
        let store = seeded(vec![entry("openai", "gpt-4o", "GPT", true, 0)], Some("gpt-4o"));
        let public = public_catalog(&store).expect("public");
        assert_eq!(public.defaults.model.as_deref(), Some("openai:gpt-4o"));
        assert_eq!(public.defaults.max_tokens, Some(256));

        update_model(
            &store,
            &ModelKey::new("openai", "gpt-4o"),
            ModelPatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .expect("disable");
        let public = public_catalog(&store).expect("public");
        assert!(public.models.is_empty());
        assert_eq!(public.defaults.model, None);
    }

    #[test]
    fn test_replace_catalog_rejects_duplicates_and_blanks() {
        let store = AdminStore::in_memory("test");
        let dup = Catalog {
            models: vec![entry("a", "m", "", true, 0), entry("a", "m", "x", true, 1)],
            defaults: CatalogDefaults::default(),
        };
        assert!(matches!(
            replace_catalog(&store, dup),
            Err(CatalogError::DuplicateModel(id)) if id == "a:m"
        ));
        let blank = Catalog {
            models: vec![entry("a", "m", "", true, 0), entry("", "m", "", true, 0)],
            defaults: CatalogDefaults::default(),
        };
        assert!(matches!(
            replace_catalog(&store, blank),
            Err(CatalogError::EmptyIdentity(1))
        ));
        assert!(store.load_catalog().expect("load").models.is_empty());
    }

    #[test]
    fn test_update_model_patch_and_not_found() {
        let store = seeded(vec![entry("a", "m", "", false, 0)], None);
        let updated = update_model(
            &store,
            &ModelKey::new("a", "m"),
            ModelPatch {
                label: Some("Nice".into()),
                enabled: Some(true),
                sort: Some(3),
                description: None,
            },
        )
        .expect("update");
        assert_eq!(updated, entry("a", "m", "Nice", true, 3));
        assert_eq!(store.load_catalog().expect("load").models[0], updated);

        let missing = update_model(&store, &ModelKey::new("a", "zz"), ModelPatch::default());
        assert!(matches!(missing, Err(CatalogError::NotFound(_))));
    }

    #[test]
    fn test_set_defaults_keeps_models() {
        let store = seeded(vec![entry("a", "m", "", true, 0)], None);
        set_defaults(
            &store,
            CatalogDefaults {
                model: Some("m".into()),
                temperature: None,
                max_tokens: None,
            },
        )
        .expect("set defaults");
        let catalog = store.load_catalog().expect("load");
        assert_eq!(catalog.models.len(), 1);
        assert_eq!(catalog.defaults.model.as_deref(), Some("m"));
    }
}
