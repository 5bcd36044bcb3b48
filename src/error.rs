use thiserror::Error;

/// 启动期配置错误：致命，构造必须中止。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is not a valid value: {value:?}")]
    Parse { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 指纹库持久化 / 变更错误。
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("fingerprint database io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fingerprint database encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate family name in database: {0}")]
    DuplicateFamily(String),

    #[error("family name must not be empty")]
    EmptyFamilyName,

    #[error("feature {0} is not a finite number")]
    NonFiniteFeature(String),
}

/// 批处理提交期校验错误。
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch of {got} images exceeds the maximum of {max}")]
    TooManyImages { got: usize, max: usize },
}
