use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("json parse error in {path}: {source}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("conversion error in {path}: {message}")]
    Conversion { path: String, message: String },

    #[error("no policy template for '{caller}': expected {path}")]
    TemplateNotFound { caller: String, path: String },

    #[error("invalid policy template {path}: {source}")]
    InvalidTemplate {
        path: String,
        #[source]
        source: policytest_domain::DomainError,
    },

    #[error("domain error: {0}")]
    Domain(#[from] policytest_domain::DomainError),
}
