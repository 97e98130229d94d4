//! LXD REST client over HTTP(S)
//!
//! Provides:
//! - Network get/create/update and lease listing
//! - ETag handling for optimistic concurrency (`If-Match`)
//! - Retry with exponential backoff for idempotent reads

use super::{Network, NetworkController, NetworkLease, NetworkPut, NetworksPost};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manifest::{ControllerConfig, RetryConfig};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::rng;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const API_PREFIX: &str = "/1.0";

/// Everything but RFC 3986 unreserved characters is escaped in a path segment
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// API path of one network, with the name escaped as a single segment
fn network_path(name: &str) -> String {
    format!("/networks/{}", utf8_percent_encode(name, SEGMENT))
}

/// Standard LXD response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    metadata: Option<T>,
}

/// A raw HTTP reply: status, ETag header and body
struct Reply {
    status: u16,
    etag: Option<String>,
    body: String,
}

/// Create backoff strategy from RetryConfig
fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// Network controller backed by the LXD REST API
pub struct HttpController {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
    retry: RetryConfig,
    ctx: Context,
}

impl HttpController {
    pub fn new(config: &ControllerConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            retry: config.retry.clone(),
            ctx: Context::background(),
        }
    }

    /// Abort requests once `ctx` is cancelled or expired
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }

    fn read_reply(mut response: ureq::http::Response<ureq::Body>) -> Result<Reply> {
        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| Error::Controller {
                status,
                message: format!("Failed to read response body: {}", e),
            })?;
        Ok(Reply { status, etag, body })
    }

    /// GET with retries on transport failures
    fn get(&self, path: &str) -> Result<Reply> {
        let url = self.url(path);
        let backoff = backoff_from_config(&self.retry);
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            self.ctx.check()?;
            attempt = attempt.saturating_add(1);

            let mut request = self.agent.get(&url);
            if let Some(auth) = self.authorization() {
                request = request.header("Authorization", auth);
            }

            match request.call() {
                Ok(response) => return Self::read_reply(response),
                Err(e) => match backoff.delay(attempt, &mut rng) {
                    Some(delay_ms) => {
                        warn!(%url, attempt, delay_ms, error = %e, "controller request failed, retrying");
                        thread::sleep(Duration::from_millis(delay_ms));
                    }
                    None => {
                        return Err(Error::Controller {
                            status: 0,
                            message: format!(
                                "GET {} failed after {} attempts: {}",
                                url, attempt, e
                            ),
                        });
                    }
                },
            }
        }
    }

    /// Write a JSON body; never retried
    fn send(&self, method: &str, path: &str, body: String, etag: Option<&str>) -> Result<Reply> {
        self.ctx.check()?;
        let url = self.url(path);
        debug!(%method, %url, "controller write");

        let mut request = match method {
            "POST" => self.agent.post(&url),
            _ => self.agent.put(&url),
        };
        request = request.header("Content-Type", "application/json");
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth);
        }
        if let Some(etag) = etag {
            request = request.header("If-Match", etag);
        }

        let response = request.send(body).map_err(|e| Error::Controller {
            status: 0,
            message: format!("{} {} failed: {}", method, url, e),
        })?;
        Self::read_reply(response)
    }

    /// Decode the envelope, mapping error statuses to error kinds
    fn decode<T: DeserializeOwned>(reply: &Reply, name: &str) -> Result<Option<T>> {
        let envelope: Envelope<T> = if reply.body.trim().is_empty() {
            Envelope {
                error: String::new(),
                error_code: 0,
                metadata: None,
            }
        } else {
            serde_json::from_str(&reply.body)?
        };

        let status = if envelope.error_code != 0 {
            envelope.error_code
        } else {
            reply.status
        };

        match status {
            200..=299 => Ok(envelope.metadata),
            404 => Err(Error::not_found("network", name)),
            412 => Err(Error::Conflict(format!(
                "network '{}' changed since it was read: {}",
                name, envelope.error
            ))),
            _ => Err(Error::Controller {
                status,
                message: envelope.error,
            }),
        }
    }
}

impl NetworkController for HttpController {
    fn get_network(&self, name: &str) -> Result<(Network, String)> {
        let reply = self.get(&network_path(name))?;
        let network: Network = Self::decode(&reply, name)?.ok_or_else(|| Error::Controller {
            status: reply.status,
            message: format!("empty response for network '{}'", name),
        })?;
        Ok((network, reply.etag.unwrap_or_default()))
    }

    fn create_network(&self, network: &NetworksPost) -> Result<()> {
        let body = serde_json::to_string(network)?;
        let reply = self.send("POST", "/networks", body, None)?;
        Self::decode::<serde_json::Value>(&reply, &network.name)?;
        Ok(())
    }

    fn update_network(&self, name: &str, put: &NetworkPut, etag: &str) -> Result<()> {
        let body = serde_json::to_string(put)?;
        let etag = Some(etag).filter(|e| !e.is_empty());
        let reply = self.send("PUT", &network_path(name), body, etag)?;
        Self::decode::<serde_json::Value>(&reply, name)?;
        Ok(())
    }

    fn get_network_leases(&self, name: &str) -> Result<Vec<NetworkLease>> {
        let reply = self.get(&format!("{}/leases", network_path(name)))?;
        Ok(Self::decode(&reply, name)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u16, body: &str) -> Reply {
        Reply {
            status,
            etag: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_decode_network() {
        let body = r#"{
            "type": "sync",
            "status": "Success",
            "status_code": 200,
            "metadata": {
                "name": "lxebr0",
                "description": "managed by LXE, default bridge",
                "type": "bridge",
                "managed": true,
                "config": {"ipv4.address": "10.0.0.1/24", "ipv4.nat": "true"}
            }
        }"#;
        let network: Network = HttpController::decode(&reply(200, body), "lxebr0")
            .unwrap()
            .unwrap();
        assert_eq!(network.kind, "bridge");
        assert!(network.managed);
        assert_eq!(network.config["ipv4.address"], "10.0.0.1/24");
    }

    #[test]
    fn test_decode_not_found() {
        let body = r#"{"type":"error","error":"Network not found","error_code":404}"#;
        let err = HttpController::decode::<Network>(&reply(404, body), "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_decode_etag_mismatch_is_conflict() {
        let body = r#"{"type":"error","error":"ETag doesn't match","error_code":412}"#;
        let err =
            HttpController::decode::<serde_json::Value>(&reply(412, body), "lxebr0").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_decode_leases() {
        let body = r#"{"type":"sync","status_code":200,"metadata":[
            {"hostname":"c1","hwaddr":"00:16:3e:00:00:01","address":"10.0.0.5","type":"dynamic"},
            {"hostname":"c1","hwaddr":"00:16:3e:00:00:01","address":"fd42::5","type":"dynamic"}
        ]}"#;
        let leases: Vec<NetworkLease> = HttpController::decode(&reply(200, body), "lxebr0")
            .unwrap()
            .unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].address, "10.0.0.5");
    }

    #[test]
    fn test_networks_post_wire_format() {
        let post = NetworksPost {
            name: "lxebr0".to_string(),
            kind: "bridge".to_string(),
            managed: true,
            put: NetworkPut {
                description: "d".to_string(),
                config: [("ipv4.nat".to_string(), "true".to_string())].into(),
            },
        };
        let value = serde_json::to_value(&post).unwrap();
        assert_eq!(value["type"], "bridge");
        assert_eq!(value["config"]["ipv4.nat"], "true");
        assert!(value.get("managed").is_none());
    }

    #[test]
    fn test_network_path_escapes_name() {
        assert_eq!(network_path("lxebr0"), "/networks/lxebr0");
        assert_eq!(network_path("lxe-br_0.v~1"), "/networks/lxe-br_0.v~1");
        assert_eq!(network_path("a/b?c#d"), "/networks/a%2Fb%3Fc%23d");
        assert_eq!(network_path("../x y"), "/networks/..%2Fx%20y");
    }

    #[test]
    fn test_cancelled_context_blocks_requests() {
        let ctx = Context::background();
        ctx.cancel();
        let controller = HttpController::new(&ControllerConfig::default()).with_context(ctx);
        let err = controller.get_network("lxebr0").unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
