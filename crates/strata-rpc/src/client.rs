//! Peer caller: one typed request to one peer
//!
//! Two shared HTTP clients cover the two built-in timeout modes; an
//! explicit caller-supplied deadline picks whichever client can honor it.
//! A successful call doubles as proof of peer liveness and is reported to
//! the registered [`LivenessSink`].

use crate::args::{CallArgs, CallResult, CallTimeout};
use crate::error::RpcError;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use strata_cluster::Network;
use strata_common::config::TimeoutConf;
use strata_common::types::NodeId;
use tracing::warn;

/// Receiver of "heard from peer" liveness notifications
pub trait LivenessSink: Send + Sync {
    fn heard_from(&self, id: &NodeId);
}

/// Shared intra-cluster HTTP caller
pub struct RpcClient {
    client: reqwest::Client,
    client_long: reqwest::Client,
    default_timeout: Duration,
    liveness: RwLock<Option<Arc<dyn LivenessSink>>>,
}

impl RpcClient {
    /// Build the two shared clients from the configured timeouts
    pub fn new(timeout: &TimeoutConf) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout.default_timeout())
            .build()
            .map_err(|e| RpcError::InvalidRequest(e.to_string()))?;
        let client_long = reqwest::Client::builder()
            .timeout(timeout.default_long())
            .build()
            .map_err(|e| RpcError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            client,
            client_long,
            default_timeout: timeout.default_timeout(),
            liveness: RwLock::new(None),
        })
    }

    /// Register the keepalive tracker; successful calls will extend the
    /// liveness deadline of the peer they reached
    pub fn set_liveness_sink(&self, sink: Arc<dyn LivenessSink>) {
        *self.liveness.write() = Some(sink);
    }

    /// Call one peer and classify the outcome
    pub async fn call(&self, mut args: CallArgs) -> CallResult {
        if args.req.base.is_empty() {
            match &args.si {
                // by default address the peer on the intra-control plane
                Some(si) => args.req.base = si.url(Network::IntraControl).to_string(),
                None => {
                    return CallResult::failed(
                        None,
                        RpcError::InvalidRequest(
                            "no destination: neither peer nor base URL given".to_string(),
                        ),
                    )
                }
            }
        }

        let url = args.req.url();
        let (client, deadline) = match args.timeout {
            CallTimeout::Default => (&self.client, None),
            CallTimeout::Long => (&self.client_long, None),
            CallTimeout::Explicit(d) => {
                if d > self.default_timeout {
                    (&self.client_long, Some(d))
                } else {
                    (&self.client, Some(d))
                }
            }
        };

        let mut builder = client.request(args.req.method.clone(), &url);
        if let Some(d) = deadline {
            builder = builder.timeout(d);
        }
        if let Some(body) = &args.req.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = RpcError::classify(&e);
                warn!(%url, %err, "peer call failed");
                return CallResult::failed(args.si, err);
            }
        };

        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return CallResult::failed(args.si, RpcError::Transport(e.to_string()));
            }
        };

        // a response arrived but carries an error: preserve its body
        if status >= 400 {
            let err = RpcError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            };
            return CallResult {
                si: args.si,
                body,
                status,
                err: Some(err),
            };
        }

        if let Some(si) = &args.si {
            if let Some(sink) = self.liveness.read().as_ref() {
                sink.heard_from(&si.id);
            }
        }

        CallResult {
            si: args.si,
            body,
            status,
            err: None,
        }
    }
}

impl CallResult {
    /// Parse a successful JSON response body
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_slice(&self.body).map_err(|e| RpcError::Transport(e.to_string()))
    }
}

/// An empty, successful result (used where a call was skipped by design)
impl Default for CallResult {
    fn default() -> Self {
        Self {
            si: None,
            body: Bytes::new(),
            status: 0,
            err: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    #[tokio::test]
    async fn test_call_requires_destination() {
        let client = RpcClient::new(&TimeoutConf::default()).unwrap();
        let res = client
            .call(CallArgs {
                si: None,
                req: crate::args::ReqArgs {
                    method: Method::GET,
                    path: "/v1/health".to_string(),
                    ..Default::default()
                },
                timeout: CallTimeout::Default,
            })
            .await;
        assert!(!res.is_ok());
        assert!(matches!(res.err, Some(RpcError::InvalidRequest(_))));
    }
}
