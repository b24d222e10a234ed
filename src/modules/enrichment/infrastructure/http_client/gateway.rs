//! One HTTP adapter for every collaborator port.
//!
//! Each collaborator is a POST of `{"key": ..., "context": ...}` to its own
//! endpoint. Language endpoints answer with JSON; media endpoints answer
//! with the raw asset and its `Content-Type`.

use super::retry_policy::{is_retryable_error, is_retryable_status, RateLimitInfo, RetryPolicy};
use crate::log_warn;
use crate::modules::enrichment::domain::{ConfusionEntry, DictionaryEntry, RichInsights};
use crate::modules::enrichment::ports::{
    AudioSynthesizer, CollaboratorContext, ConfusionAnalyzer, DictionaryLookup, GeneratedMedia,
    ImageGenerator, InsightGenerator, Interpretation, Interpreter,
};
use crate::shared::errors::{AppError, AppResult};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorEndpoints {
    pub dictionary: String,
    pub interpret: String,
    pub confusion: String,
    pub image: String,
    pub audio: String,
    pub insights: String,
}

impl CollaboratorEndpoints {
    /// `<base>/dictionary`, `<base>/interpret` and so on
    pub fn from_base_url(base_url: &str) -> AppResult<Self> {
        let base = base_url.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(AppError::ConfigurationError(format!(
                "COLLABORATOR_BASE_URL must be an http(s) URL, got '{}'",
                base_url
            )));
        }

        let endpoint = |path: &str| format!("{}/{}", base, path);
        Ok(Self {
            dictionary: endpoint("dictionary"),
            interpret: endpoint("interpret"),
            confusion: endpoint("confusion"),
            image: endpoint("image"),
            audio: endpoint("audio"),
            insights: endpoint("insights"),
        })
    }
}

#[derive(Serialize)]
struct CollaboratorRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a CollaboratorContext>,
}

pub struct HttpCollaboratorGateway {
    client: Client,
    endpoints: CollaboratorEndpoints,
    language_policy: RetryPolicy,
    media_policy: RetryPolicy,
    user_agent: String,
}

impl HttpCollaboratorGateway {
    pub fn new(endpoints: CollaboratorEndpoints) -> AppResult<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoints,
            language_policy: RetryPolicy::language(),
            media_policy: RetryPolicy::media(),
            user_agent: format!("hanzi-enrichment/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn with_policies(mut self, language: RetryPolicy, media: RetryPolicy) -> Self {
        self.language_policy = language;
        self.media_policy = media;
        self
    }

    pub fn endpoints(&self) -> &CollaboratorEndpoints {
        &self.endpoints
    }

    async fn post_json<T>(
        &self,
        service: &str,
        url: &str,
        key: &str,
        context: Option<&CollaboratorContext>,
    ) -> AppResult<T>
    where
        T: DeserializeOwned,
    {
        let body = CollaboratorRequest { key, context };
        let response = self
            .send_with_retries(service, url, &body, &self.language_policy)
            .await?;
        parse_response(service, response).await
    }

    async fn post_media(
        &self,
        service: &str,
        url: &str,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<GeneratedMedia> {
        let body = CollaboratorRequest {
            key,
            context: Some(context),
        };
        let response = self
            .send_with_retries(service, url, &body, &self.media_policy)
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await?.to_vec();

        if bytes.is_empty() {
            return Err(AppError::ValidationError(format!(
                "{} returned an empty asset for '{}'",
                service, key
            )));
        }
        Ok(GeneratedMedia {
            bytes,
            content_type,
        })
    }

    async fn send_with_retries<B: Serialize + Sync>(
        &self,
        service: &str,
        url: &str,
        body: &B,
        policy: &RetryPolicy,
    ) -> AppResult<Response> {
        for attempt in 0..=policy.max_retries {
            let sent = self
                .client
                .post(url)
                .header(USER_AGENT, &self.user_agent)
                .header(ACCEPT, "application/json")
                .json(body)
                .send()
                .await;

            let can_retry = attempt < policy.max_retries;
            match sent {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if is_retryable_status(status) && can_retry {
                        let info = RateLimitInfo::from_headers(response.headers());
                        let delay = policy.calculate_delay(attempt, info.recommended_delay());
                        log_warn!(
                            "{} returned {} (attempt {}/{}), retrying in {:?}",
                            service,
                            status,
                            attempt + 1,
                            policy.max_retries + 1,
                            delay
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Err(status_error(service, status));
                }
                Err(e) => {
                    if is_retryable_error(&e) && can_retry {
                        let delay = policy.calculate_delay(attempt, None);
                        log_warn!(
                            "{} request failed (attempt {}/{}): {}. Retrying in {:?}",
                            service,
                            attempt + 1,
                            policy.max_retries + 1,
                            e,
                            delay
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }

        Err(AppError::ExternalServiceError(format!(
            "{} request failed after {} attempts",
            service,
            policy.max_retries + 1
        )))
    }
}

fn status_error(service: &str, status: StatusCode) -> AppError {
    match status.as_u16() {
        429 => AppError::RateLimitExceeded(format!("{} is throttling requests", service)),
        401 | 403 => AppError::ConfigurationError(format!("{} rejected our credentials", service)),
        404 => AppError::NotFound(format!("{} endpoint not found", service)),
        _ => AppError::ExternalServiceError(format!("{} returned {}", service, status)),
    }
}

async fn parse_response<T: DeserializeOwned>(service: &str, response: Response) -> AppResult<T> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        // Malformed generator output is a validation problem, not a transport one
        AppError::ValidationError(format!(
            "could not parse {} response: {}. Response: {}",
            service, e, preview
        ))
    })
}

#[async_trait]
impl DictionaryLookup for HttpCollaboratorGateway {
    async fn lookup(&self, key: &str) -> AppResult<Vec<DictionaryEntry>> {
        match self
            .post_json("dictionary", &self.endpoints.dictionary, key, None)
            .await
        {
            Err(AppError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }
}

#[async_trait]
impl Interpreter for HttpCollaboratorGateway {
    async fn interpret(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<Interpretation> {
        self.post_json("interpreter", &self.endpoints.interpret, key, Some(context))
            .await
    }
}

#[async_trait]
impl ConfusionAnalyzer for HttpCollaboratorGateway {
    async fn analyze(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<Vec<ConfusionEntry>> {
        self.post_json("confusion analyzer", &self.endpoints.confusion, key, Some(context))
            .await
    }
}

#[async_trait]
impl ImageGenerator for HttpCollaboratorGateway {
    async fn generate_image(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<GeneratedMedia> {
        self.post_media("image generator", &self.endpoints.image, key, context)
            .await
    }
}

#[async_trait]
impl AudioSynthesizer for HttpCollaboratorGateway {
    async fn synthesize(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<GeneratedMedia> {
        self.post_media("speech synthesizer", &self.endpoints.audio, key, context)
            .await
    }
}

#[async_trait]
impl InsightGenerator for HttpCollaboratorGateway {
    async fn generate_insights(
        &self,
        key: &str,
        context: &CollaboratorContext,
    ) -> AppResult<RichInsights> {
        self.post_json("insight generator", &self.endpoints.insights, key, Some(context))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_from_base_url() {
        let endpoints = CollaboratorEndpoints::from_base_url("https://ai.internal/v1/").unwrap();
        assert_eq!(endpoints.dictionary, "https://ai.internal/v1/dictionary");
        assert_eq!(endpoints.insights, "https://ai.internal/v1/insights");
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let err = CollaboratorEndpoints::from_base_url("ftp://nope").unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[test]
    fn test_status_errors_follow_taxonomy() {
        assert!(matches!(
            status_error("x", StatusCode::TOO_MANY_REQUESTS),
            AppError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            status_error("x", StatusCode::FORBIDDEN),
            AppError::ConfigurationError(_)
        ));
        assert!(status_error("x", StatusCode::SERVICE_UNAVAILABLE).is_retryable());
    }

    #[test]
    fn test_request_body_shape() {
        let context = CollaboratorContext {
            gloss: Some("water".to_string()),
            ..Default::default()
        };
        let body = serde_json::to_value(CollaboratorRequest {
            key: "水",
            context: Some(&context),
        })
        .unwrap();
        assert_eq!(body["key"], "水");
        assert_eq!(body["context"]["gloss"], "water");

        let bare = serde_json::to_value(CollaboratorRequest {
            key: "水",
            context: None,
        })
        .unwrap();
        assert!(bare.get("context").is_none());
    }

    #[tokio::test]
    async fn test_gateway_builds() {
        let endpoints = CollaboratorEndpoints::from_base_url("http://localhost:9").unwrap();
        let gateway = HttpCollaboratorGateway::new(endpoints.clone())
            .unwrap()
            .with_policies(RetryPolicy::none(), RetryPolicy::none());
        assert_eq!(gateway.endpoints(), &endpoints);
    }
}
