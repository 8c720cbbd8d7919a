//! Common utilities for the hardware plugin client
//!
//! Shared HTTP plumbing: URL building, bearer authentication and status mapping.

use crate::error::HwPluginError;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// Base path of the provisioning API
pub const PROVISIONING_API_PATH: &str = "/hardware-manager/provisioning/v1";

/// HTTP client wrapper with authentication
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    pub fn new(client: Client, base_url: String, token: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from a provisioning API path
    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, PROVISIONING_API_PATH, path)
    }

    /// Get authorization header value
    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Encode a single path segment (allocation ids are opaque strings)
    pub fn encode_segment(segment: &str) -> String {
        urlencoding::encode(segment).into_owned()
    }

    /// Make a GET request
    pub async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, HwPluginError> {
        let url = self.build_url(path);
        debug!("GET {}", url);

        let response = self.client
            .get(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await?;

        let response = Self::check_status("GET", path, response).await?;
        response.json().await.map_err(HwPluginError::Http)
    }

    /// Make a POST request
    pub async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, HwPluginError> {
        let url = self.build_url(path);
        debug!("POST {} with body: {}", url, body);

        let response = self.client
            .post(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let response = Self::check_status("POST", path, response).await?;
        response.json().await.map_err(HwPluginError::Http)
    }

    /// Make a PUT request
    pub async fn put<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, HwPluginError> {
        let url = self.build_url(path);
        debug!("PUT {} with body: {}", url, body);

        let response = self.client
            .put(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let response = Self::check_status("PUT", path, response).await?;
        response.json().await.map_err(HwPluginError::Http)
    }

    /// Make a DELETE request. Accepts 200, 202 and 204.
    pub async fn delete(&self, path: &str) -> Result<(), HwPluginError> {
        let url = self.build_url(path);
        debug!("DELETE {}", url);

        let response = self.client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await?;

        Self::check_status("DELETE", path, response).await?;
        Ok(())
    }

    /// Maps non-success statuses to typed errors
    async fn check_status(method: &str, path: &str, response: Response) -> Result<Response, HwPluginError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{} {} failed: {} - {}", method, path, status, body);
        Err(match status {
            StatusCode::NOT_FOUND => HwPluginError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HwPluginError::Authentication(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
                HwPluginError::InvalidRequest(message)
            }
            _ => HwPluginError::Api(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_trims_trailing_slash() {
        let http = HttpClient::new(Client::new(), "https://plugin:8443/".to_string(), "t".to_string());
        assert_eq!(
            http.build_url("/node-allocation-requests"),
            "https://plugin:8443/hardware-manager/provisioning/v1/node-allocation-requests"
        );
        assert_eq!(http.auth_header(), "Bearer t");
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(HttpClient::encode_segment("a/b c"), "a%2Fb%20c");
    }
}
