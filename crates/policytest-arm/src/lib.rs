pub mod client;
pub mod error;
pub mod session;

pub use client::{parse_arm_error, ArmClient, ArmRequest, ArmResponse, BaseUrls, LroPolicy, ResponseKind};
pub use error::ArmError;
pub use session::{AccessToken, Credentials, Session, StaticToken, TokenProvider, DEFAULT_LOGIN_BASE};

/// Re-exported so callers can build requests with arbitrary verbs.
pub use reqwest::Method;
