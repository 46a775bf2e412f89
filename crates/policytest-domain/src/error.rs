use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid run id: {0}")]
    InvalidRunId(String),

    #[error("invalid region '{0}': expected a lowercase Azure region name such as 'northeurope'")]
    InvalidRegion(String),

    #[error("invalid settings for region '{region}': {message}")]
    InvalidRegionSettings { region: String, message: String },

    #[error("malformed policy document: {0}")]
    MalformedPolicy(String),

    #[error("unknown policy effect '{0}'")]
    UnknownEffect(String),

    #[error("effect of policy '{policy}' references parameter '{parameter}' which has no value")]
    UnresolvedEffect { policy: String, parameter: String },
}
