use async_trait::async_trait;
use tandem_proto::{IceServer, IceServerList};
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum IceProvisionError {
    #[error("ice server request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ice server endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Supplies STUN/TURN servers for a new peer connection. Called once per
/// session, before the connection exists.
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceProvisionError>;
}

/// `GET {url}` returning `{"iceServers": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpIceServerProvider {
    client: reqwest::Client,
    url: Url,
    bearer_token: Option<String>,
}

impl HttpIceServerProvider {
    pub fn new(url: Url, bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            bearer_token,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl IceServerProvider for HttpIceServerProvider {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceProvisionError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IceProvisionError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let list: IceServerList = response.json().await?;
        debug!(count = list.ice_servers.len(), "fetched ice servers");
        Ok(list.ice_servers)
    }
}

/// A fixed list, for deployments without an ICE endpoint.
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers(pub Vec<IceServer>);

impl StaticIceServers {
    pub fn stun(urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(vec![IceServer {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }])
    }
}

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceProvisionError> {
        Ok(self.0.clone())
    }
}
