//! Directory ("master") server notifications.
//!
//! The master server lists tunnels to game clients. When this tunnel starts
//! draining it tells the master so no new games are routed here. Delivery is
//! best effort: one attempt, failures are logged by the caller and dropped.

use std::time::Duration;

use async_trait::async_trait;

use crate::version::VERSION;

/// What the master is told about this tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAdvert {
    pub name: String,
    pub has_password: bool,
    pub port: u16,
    pub clients: usize,
    pub max_clients: usize,
    pub maintenance: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("master request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("master returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait DirectoryNotifier: Send + Sync {
    async fn notify(&self, advert: &TunnelAdvert) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub url: String,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl MasterConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }
}

/// HTTP client for the master server's v2 announce endpoint.
pub struct MasterClient {
    config: MasterConfig,
    client: reqwest::Client,
}

impl MasterClient {
    pub fn new(config: MasterConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("cnctunnel/{}", VERSION))
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn query(&self, advert: &TunnelAdvert) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("version", "2".to_string()),
            ("name", advert.name.clone()),
            (
                "password",
                if advert.has_password { "1" } else { "0" }.to_string(),
            ),
            ("port", advert.port.to_string()),
            ("clients", advert.clients.to_string()),
            ("maxclients", advert.max_clients.to_string()),
        ];
        if let Some(ref pw) = self.config.password {
            query.push(("masterpw", pw.clone()));
        }
        if advert.maintenance {
            query.push(("maintenance", "1".to_string()));
        }
        query
    }
}

#[async_trait]
impl DirectoryNotifier for MasterClient {
    async fn notify(&self, advert: &TunnelAdvert) -> Result<(), NotifyError> {
        let response = self
            .client
            .get(&self.config.url)
            .query(&self.query(advert))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        tracing::debug!(status = %status.as_u16(), "Master notified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn advert() -> TunnelAdvert {
        TunnelAdvert {
            name: "Relay EU #1".to_string(),
            has_password: false,
            port: 50001,
            clients: 6,
            max_clients: 200,
            maintenance: true,
        }
    }

    #[tokio::test]
    async fn notify_sends_v2_query() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/announce"))
            .and(query_param("version", "2"))
            .and(query_param("name", "Relay EU #1"))
            .and(query_param("password", "0"))
            .and(query_param("port", "50001"))
            .and(query_param("clients", "6"))
            .and(query_param("maxclients", "200"))
            .and(query_param("maintenance", "1"))
            .and(query_param_is_missing("masterpw"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = MasterClient::new(MasterConfig::new(format!("{}/announce", server.uri())))
            .unwrap();
        client.notify(&advert()).await.unwrap();
    }

    #[tokio::test]
    async fn notify_includes_master_password() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/announce"))
            .and(query_param("masterpw", "s3cret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = MasterConfig::new(format!("{}/announce", server.uri()))
            .with_password(Some("s3cret".to_string()));
        let client = MasterClient::new(config).unwrap();
        client.notify(&advert()).await.unwrap();
    }

    #[tokio::test]
    async fn notify_reports_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = MasterClient::new(MasterConfig::new(server.uri())).unwrap();
        let err = client.notify(&advert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(404)));
    }

    #[tokio::test]
    async fn notify_reports_unreachable_master() {
        // Nothing listens on the discard port.
        let config = MasterConfig {
            timeout: Duration::from_millis(200),
            ..MasterConfig::new("http://127.0.0.1:9/")
        };
        let client = MasterClient::new(config).unwrap();
        let err = client.notify(&advert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)));
    }
}
