use thiserror::Error;

/**
 * \brief 密文解析/解密失败。
 */
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("unrecognized ciphertext format")]
    BadFormat,
    #[error("encryption key is not configured")]
    MissingKey,
    #[error("invalid base64 segment: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext could not be authenticated")]
    Cipher,
}

/**
 * \brief 模型同步失败。单个 Provider 的上游错误不会出现在这里，见 `SyncReport::skipped`。
 */
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no matching provider to sync")]
    NoProviders,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/**
 * \brief 对话分发解析失败。
 */
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("model id `{0}` must look like `<provider>:<model>`")]
    MalformedModelId(String),
    #[error("no active provider `{0}`")]
    ModelNotFound(String),
    #[error("provider `{0}` has no usable API key")]
    InvalidApiKey(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl DispatchError {
    /**
     * \brief 返回给聊天端的稳定错误码。
     */
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::MalformedModelId(_) => "MALFORMED_MODEL_ID",
            DispatchError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            DispatchError::InvalidApiKey(_) => "INVALID_API_KEY",
            DispatchError::Store(_) => "STORE_ERROR",
        }
    }
}

/**
 * \brief 管理员整体替换目录时的校验失败。
 */
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate model entry `{0}`")]
    DuplicateModel(String),
    #[error("model entry #{0} is missing provider or value")]
    EmptyIdentity(usize),
    #[error("model `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/**
 * \brief Provider 管理操作失败。
 */
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("slug `{0}` already exists")]
    DuplicateSlug(String),
    #[error("provider `{0}` not found")]
    NotFound(String),
    #[error("failed to encrypt api key")]
    Encrypt,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_codes() {
        assert_eq!(
            DispatchError::MalformedModelId("x".into()).code(),
            "MALFORMED_MODEL_ID"
        );
        assert_eq!(
            DispatchError::ModelNotFound("x".into()).code(),
            "MODEL_NOT_FOUND"
        );
        assert_eq!(
            DispatchError::InvalidApiKey("x".into()).code(),
            "INVALID_API_KEY"
        );
    }
}
