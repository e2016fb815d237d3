use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::config::Config;

/// Failure reported by a remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned HTTP {0}")]
    Status(u16),
}

impl FetchError {
    /// Worth retrying later: timeouts, connectivity, throttling and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Status(code) => *code == 429 || (500..600).contains(code),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// Remote message-fetch API.
#[async_trait]
pub trait InboxSource: Send + Sync {
    /// Raw body of the inbox listing; parsing is left to the sync engine.
    async fn fetch_messages(&self) -> Result<Vec<u8>, FetchError>;

    /// Raw body of a single message record.
    async fn fetch_message(&self, id: &str) -> Result<Vec<u8>, FetchError>;

    /// Tell the server a message was opened.
    async fn mark_read(&self, id: &str) -> Result<(), FetchError>;
}

/// Remote image-fetch API.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Inbox endpoints of the mobile-apps API, plus plain GETs for icons.
#[derive(Clone)]
pub struct HttpInboxSource {
    client: Client,
    auth: HeaderValue,
    messages_url: Url,
}

impl HttpInboxSource {
    pub fn new(config: &Config) -> Result<Self, String> {
        let mut auth = HeaderValue::from_str(&format!("MobileAppToken {}", config.token))
            .map_err(|e| format!("bad token: {e}"))?;
        auth.set_sensitive(true);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| format!("http client: {e}"))?;

        Ok(HttpInboxSource {
            client,
            auth,
            messages_url: messages_url(config)?,
        })
    }

    fn message_url(&self, id: &str) -> Result<Url, FetchError> {
        let mut url = self.messages_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Network("base url cannot hold a path".into()))?
            .push(id);
        Ok(url)
    }
}

fn messages_url(config: &Config) -> Result<Url, String> {
    let mut url = Url::parse(&config.api_url).map_err(|e| format!("bad api url: {e}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("api url cannot be a base: {}", config.api_url))?
        .pop_if_empty()
        .extend([
            config.app_id.as_str(),
            "persons",
            config.person_key.as_str(),
            "messages",
        ]);
    Ok(url)
}

fn check_status(status: StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::Status(status.as_u16()))
    }
}

#[async_trait]
impl InboxSource for HttpInboxSource {
    async fn fetch_messages(&self) -> Result<Vec<u8>, FetchError> {
        log::debug!("GET {}", self.messages_url);
        let resp = self
            .client
            .get(self.messages_url.clone())
            .header(AUTHORIZATION, self.auth.clone())
            .send()
            .await?;
        check_status(resp.status())?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn fetch_message(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.message_url(id)?;
        log::debug!("GET {}", url);
        let resp = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.auth.clone())
            .send()
            .await?;
        check_status(resp.status())?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn mark_read(&self, id: &str) -> Result<(), FetchError> {
        let url = self.message_url(id)?;
        log::debug!("PUT {}", url);
        let resp = self
            .client
            .put(url)
            .header(AUTHORIZATION, self.auth.clone())
            .json(&serde_json::json!({ "read": true }))
            .send()
            .await?;
        check_status(resp.status())
    }
}

#[async_trait]
impl ImageSource for HttpInboxSource {
    async fn fetch_image(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        // Icons live on public hosts, so no API token here.
        let resp = self.client.get(url.clone()).send().await?;
        check_status(resp.status())?;
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: &str) -> Config {
        Config {
            api_url: api_url.into(),
            app_id: "APP".into(),
            person_key: "person-1".into(),
            token: "secret".into(),
            ..Config::default()
        }
    }

    #[test]
    fn messages_url_appends_path() {
        let url = messages_url(&config("https://api.example.com/mobile_apps")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/mobile_apps/APP/persons/person-1/messages"
        );
    }

    #[test]
    fn messages_url_tolerates_trailing_slash() {
        let url = messages_url(&config("https://api.example.com/mobile_apps/")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/mobile_apps/APP/persons/person-1/messages"
        );
    }

    #[test]
    fn message_url_escapes_id() {
        let source = HttpInboxSource::new(&config("https://api.example.com")).unwrap();
        let url = source.message_url("a b/c").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/APP/persons/person-1/messages/a%20b%2Fc"
        );
    }

    #[test]
    fn bad_api_url_is_rejected() {
        assert!(messages_url(&config("not a url")).is_err());
        assert!(messages_url(&config("mailto:x@example.com")).is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(FetchError::Status(503).is_transient());
        assert!(FetchError::Status(429).is_transient());
        assert!(!FetchError::Status(401).is_transient());
        assert!(!FetchError::Status(404).is_transient());
    }
}
