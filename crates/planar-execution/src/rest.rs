//! HTTP execution unit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::{debug, info};

use crate::channel::JobChannel;
use crate::context::DataMap;
use crate::failure::FailureInfo;
use crate::unit::{ExecutionUnit, UnitError};

/// Response bytes copied into the execution log.
const LOGGED_BODY_CHARS: usize = 1024;

/// Runs a single HTTP request. Non-2xx responses fail the execution.
///
/// `{{key}}` placeholders in the URL, header values and body are replaced with
/// values from the merged data map.
#[derive(Debug, Clone)]
pub struct RestUnit {
    client: Client,
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
}

impl RestUnit {
    pub fn new(
        client: Client,
        method: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            client,
            method: method.into(),
            url: url.into(),
            headers,
            body,
        }
    }

    /// Replace `{{key}}` with data values. Unknown keys are left as-is.
    fn substitute(template: &str, data: &DataMap) -> String {
        let mut result = template.to_string();
        for (key, value) in data {
            result = result.replace(&format!("{{{{{key}}}}}"), value);
        }
        result
    }
}

#[async_trait]
impl ExecutionUnit for RestUnit {
    fn kind(&self) -> &str {
        "rest"
    }

    async fn execute(&self, channel: JobChannel) -> Result<(), UnitError> {
        let data = &channel.context().merged_data;
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes()).map_err(|_| {
            FailureInfo::with_kind("http", format!("invalid HTTP method: {}", self.method))
        })?;
        let url = Self::substitute(&self.url, data);

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), Self::substitute(value, data));
        }
        if let Some(body) = &self.body {
            request = request.body(Self::substitute(body, data));
        }

        channel.append_log(format!("{method} {url}")).await?;
        debug!(method = %method, url = %url, "sending REST unit request");

        let response = request.send().await.map_err(|e| {
            FailureInfo::with_kind("http", format!("request to {url} failed"))
                .caused_by(FailureInfo::from_error(&e))
        })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let logged: String = text.chars().take(LOGGED_BODY_CHARS).collect();

        channel
            .append_log(format!("response {status}: {logged}"))
            .await?;
        info!(url = %url, status = %status, "REST unit finished");

        if !status.is_success() {
            return Err(FailureInfo::with_kind(
                "http",
                format!("{method} {url} returned {status}"),
            )
            .into());
        }
        Ok(())
    }
}
