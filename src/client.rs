//! A client for the HTTP transport that follows leader redirects.

use crate::rpc::{
    send_get, send_request, Ack, ErrorBody, ExecuteRequest, ExecuteResponse, ExecuteResult,
    MembershipRequest, NodeStatus, VisibilityRequest,
};
use hyper::client::HttpConnector;
use hyper::Client;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no leader answered after {0} attempts")]
    MaxRetriesReached(usize),
    #[error("request failed with status {status}: {body:?}")]
    Status {
        status: u16,
        body: Option<ErrorBody>,
    },
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// The leader named by a `403` redirect, if any.
    pub fn redirect(&self) -> Option<&str> {
        match self {
            ClientError::Status {
                status: 403,
                body: Some(body),
            } => body.address.as_deref(),
            _ => None,
        }
    }
}

pub struct HttpClient {
    leader_address: String,
    max_retries: usize,
    http: Client<HttpConnector>,
}

impl HttpClient {
    /// `address` may be any member; requests are redirected to the leader as it is found.
    pub fn new<A: Into<String>>(address: A, max_retries: usize) -> HttpClient {
        HttpClient {
            leader_address: address.into(),
            max_retries,
            http: Client::new(),
        }
    }

    pub fn leader_address(&self) -> &str {
        &self.leader_address
    }

    pub async fn execute(
        &mut self,
        command: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<ExecuteResult, ClientError> {
        let request = ExecuteRequest {
            command: command.to_string(),
            key: key.to_string(),
            value: value.map(str::to_string),
        };
        let response: ExecuteResponse = self.send_to_leader("execute", &request).await?;
        Ok(response.result)
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<ExecuteResult, ClientError> {
        self.execute("set", key, Some(value)).await
    }

    pub async fn get(&mut self, key: &str) -> Result<ExecuteResult, ClientError> {
        self.execute("get", key, None).await
    }

    pub async fn join_cluster(&mut self, address: &str) -> Result<(), ClientError> {
        let request = MembershipRequest {
            address: address.to_string(),
        };
        let _: Ack = self.send_to_leader("join_cluster", &request).await?;
        Ok(())
    }

    pub async fn remove_member(&mut self, address: &str) -> Result<(), ClientError> {
        let request = MembershipRequest {
            address: address.to_string(),
        };
        let _: Ack = self.send_to_leader("remove_member", &request).await?;
        Ok(())
    }

    /// Status of the node at `address`, which need not be the leader.
    pub async fn status(&self, address: &str) -> Result<NodeStatus, ClientError> {
        send_get(&self.http, address, "status").await
    }

    pub async fn shutdown(&self, address: &str) -> Result<(), ClientError> {
        let _: Ack = send_request(&self.http, address, "shutdown", &()).await?;
        Ok(())
    }

    pub async fn set_heartbeat_visibility(
        &self,
        address: &str,
        visibility: bool,
    ) -> Result<(), ClientError> {
        let request = VisibilityRequest { visibility };
        let _: Ack = send_request(&self.http, address, "heartbeat_visibility", &request).await?;
        Ok(())
    }

    async fn send_to_leader<S, D>(&mut self, method: &str, request: &S) -> Result<D, ClientError>
    where
        S: Serialize,
        D: DeserializeOwned,
    {
        for attempt in 0..self.max_retries {
            trace!(
                "{}: attempt {} against {}",
                method,
                attempt + 1,
                self.leader_address
            );
            match send_request(&self.http, &self.leader_address, method, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if let Some(leader) = e.redirect() {
                        debug!("{}: redirected to leader at {}", method, leader);
                        self.leader_address = leader.to_string();
                        continue;
                    }
                    match e {
                        // No leader yet, or the node is unreachable or stopping.
                        ClientError::Status {
                            status: 403 | 503, ..
                        }
                        | ClientError::Http(_) => {
                            debug!("{}: {}; retrying", method, e);
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                        e => return Err(e),
                    }
                }
            }
        }
        Err(ClientError::MaxRetriesReached(self.max_retries))
    }
}
