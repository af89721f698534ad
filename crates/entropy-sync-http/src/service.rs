use std::collections::BTreeSet;
use std::time::Duration;

use entropy_sync::repository::ServiceEndpoint;
use entropy_sync::service::{
    RepositoryQuery, ServiceConnection, ServiceConnector, ServiceError, SessionToken,
};
use entropy_sync::store::PackageId;
use serde_json::{Value, json};

fn transport(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout
    } else if e.is_connect() {
        ServiceError::Connect(e.to_string())
    } else {
        ServiceError::Transport(e.to_string())
    }
}

/// Client for the differential service, spoken as JSON over HTTP under
/// `/eapi3` on the repository's service endpoint.
pub struct HttpServiceConnector {
    client: reqwest::Client,
}

impl HttpServiceConnector {
    pub fn new() -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ServiceConnector for HttpServiceConnector {
    async fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
    ) -> Result<Box<dyn ServiceConnection>, ServiceError> {
        let base = format!("http://{endpoint}/eapi3");
        let response = self
            .client
            .get(format!("{base}/hello"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| match transport(e) {
                ServiceError::Transport(msg) => ServiceError::Connect(format!("{endpoint}: {msg}")),
                other => other,
            })?;
        if !response.status().is_success() {
            return Err(ServiceError::Connect(format!(
                "{endpoint}: HTTP {}",
                response.status()
            )));
        }
        tracing::debug!(%endpoint, "connected to differential service");

        Ok(Box::new(HttpServiceConnection {
            client: self.client.clone(),
            base,
            timeout,
        }))
    }
}

struct HttpServiceConnection {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl HttpServiceConnection {
    async fn call(&self, route: &str, body: Value) -> Result<Value, ServiceError> {
        let response = self
            .client
            .post(format!("{}/{route}", self.base))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Protocol(format!("{route}: HTTP {status}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ServiceError::Protocol(format!("{route}: {e}")))
    }
}

#[async_trait::async_trait]
impl ServiceConnection for HttpServiceConnection {
    async fn open_session(&mut self) -> Result<SessionToken, ServiceError> {
        let reply = self.call("session", json!({})).await?;
        reply
            .get("session")
            .and_then(Value::as_str)
            .map(SessionToken::new)
            .ok_or_else(|| ServiceError::Protocol(format!("no session in reply: {reply}")))
    }

    async fn close_session(&mut self, session: &SessionToken) -> Result<(), ServiceError> {
        self.call("session/close", json!({ "session": session }))
            .await
            .map(|_| ())
    }

    async fn differential_comparison(
        &mut self,
        session: &SessionToken,
        query: &RepositoryQuery,
        local_ids: &BTreeSet<PackageId>,
    ) -> Result<Value, ServiceError> {
        self.call(
            "differential",
            json!({ "session": session, "query": query, "ids": local_ids }),
        )
        .await
    }

    async fn package_records(
        &mut self,
        session: &SessionToken,
        query: &RepositoryQuery,
        ids: &[PackageId],
    ) -> Result<Value, ServiceError> {
        self.call(
            "packages",
            json!({ "session": session, "query": query, "ids": ids }),
        )
        .await
    }

    async fn repository_metadata(
        &mut self,
        session: &SessionToken,
        query: &RepositoryQuery,
    ) -> Result<Value, ServiceError> {
        self.call("metadata", json!({ "session": session, "query": query }))
            .await
    }

    async fn disconnect(&mut self) {
        tracing::debug!(base = %self.base, "leaving differential service");
    }
}
