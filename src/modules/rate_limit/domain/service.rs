use serde::{Deserialize, Serialize};

/// External dependencies that each get their own token bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalService {
    /// Interpretation, confusion analysis and insight generation
    Language,
    Image,
    Speech,
}

impl ExternalService {
    pub const ALL: [ExternalService; 3] = [
        ExternalService::Language,
        ExternalService::Image,
        ExternalService::Speech,
    ];

    /// Key used for the shared token store
    pub fn bucket_key(&self) -> &'static str {
        match self {
            ExternalService::Language => "rate:language",
            ExternalService::Image => "rate:image",
            ExternalService::Speech => "rate:speech",
        }
    }
}

impl std::fmt::Display for ExternalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalService::Language => write!(f, "language"),
            ExternalService::Image => write!(f, "image"),
            ExternalService::Speech => write!(f, "speech"),
        }
    }
}

impl std::str::FromStr for ExternalService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "language" => Ok(ExternalService::Language),
            "image" => Ok(ExternalService::Image),
            "speech" => Ok(ExternalService::Speech),
            _ => Err(format!("Invalid external service: {}", s)),
        }
    }
}
