use crate::client::ClientError;
use crate::config::{Config, TimingConfig};
use crate::error::RaftError;
use crate::rpc::{
    Ack, AppendEntriesRequest, AppendEntriesResponse, ErrorBody, MembershipRequest, RPCBuilder,
    RaftServer, RequestVoteRequest, RequestVoteResponse, VisibilityRequest, RPC,
};
use async_channel::Receiver;
use bytes::Buf;
use futures::TryFutureExt;
use hyper::client::HttpConnector;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use log::{debug, error, info, trace};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::convert::Infallible;
use std::error::Error;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HttpConfig {
    /// Address to listen on. Defaults to the node's own address.
    pub bind: Option<String>,
}

impl RPCBuilder for HttpConfig {
    fn build(
        &self,
        config: &Config,
        server: RaftServer,
        shutdown: Receiver<()>,
    ) -> io::Result<(Arc<dyn RPC>, JoinHandle<()>)> {
        let bind = self.bind.as_deref().unwrap_or(&config.address);
        let handle = start_server(bind, server, shutdown)?;
        Ok((Arc::new(HttpRPC::with_timeout(config.rpc_timeout())), handle))
    }
}

#[derive(Clone)]
pub struct HttpRPC {
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl HttpRPC {
    pub fn new() -> HttpRPC {
        HttpRPC::with_timeout(Duration::from_millis(TimingConfig::default().rpc_timeout_ms))
    }

    /// Every call fails once `timeout` passes without a response.
    pub fn with_timeout(timeout: Duration) -> HttpRPC {
        HttpRPC {
            client: Client::new(),
            timeout,
        }
    }

    async fn call<S, D>(
        &self,
        peer_address: &str,
        method_name: &str,
        request: &S,
    ) -> Result<D, Box<dyn Error + Send + Sync>>
    where
        S: Serialize + ?Sized,
        D: DeserializeOwned,
    {
        let response = send_request(&self.client, peer_address, method_name, request);
        match timeout(self.timeout, response).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(format!(
                "{} to {} timed out after {:?}",
                method_name, peer_address, self.timeout
            )
            .into()),
        }
    }
}

impl Default for HttpRPC {
    fn default() -> Self {
        HttpRPC::new()
    }
}

#[async_trait::async_trait]
impl RPC for HttpRPC {
    async fn append_entries(
        &self,
        peer_address: String,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, Box<dyn Error + Send + Sync>> {
        self.call(&peer_address, "append_entries", &request).await
    }

    async fn request_vote(
        &self,
        peer_address: String,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, Box<dyn Error + Send + Sync>> {
        self.call(&peer_address, "request_vote", &request).await
    }

    async fn shutdown(&self, peer_address: String) -> Result<(), Box<dyn Error + Send + Sync>> {
        let _: Ack = self.call(&peer_address, "shutdown", &()).await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
enum HttpError {
    #[error("could not read request body: {0}")]
    Body(#[from] hyper::Error),
    #[error("malformed request body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not build response: {0}")]
    Response(#[from] hyper::http::Error),
}

fn start_server(
    bind: &str,
    server: RaftServer,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    let addr = bind.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} did not resolve to an address", bind),
        )
    })?;
    let server = Arc::new(server);
    let make_svc = make_service_fn(move |socket: &AddrStream| {
        trace!("Serving new connection from {}", socket.remote_addr());
        let server = server.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                trace!("Serving request {} {}", req.method(), req.uri());
                let server = server.clone();
                async move { Ok::<_, Infallible>(serve_request(server, req).await) }
            }))
        }
    });

    let http = Server::try_bind(&addr)
        .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, e))?
        .serve(make_svc);
    info!("Serving Raft at {}", http.local_addr());
    let http = http.with_graceful_shutdown(async move {
        // Resolves once the node drops its end of the channel.
        let _ = shutdown.recv().await;
    });
    Ok(tokio::spawn(async move {
        if let Err(e) = http.await {
            error!("Server error: {}", e);
        }
        info!("Stopped serving Raft at {}", addr);
    }))
}

async fn serve_request(server: Arc<RaftServer>, req: Request<Body>) -> Response<Body> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/v1/request_vote") => {
            parse_request_body(req)
                .and_then(|req| async move { reply(server.request_vote(req).await) })
                .await
        }
        (&Method::POST, "/v1/append_entries") => {
            parse_request_body(req)
                .and_then(|req| async move { reply(server.append_entries(req).await) })
                .await
        }
        (&Method::POST, "/v1/execute") => {
            parse_request_body(req)
                .and_then(|req| async move { reply(server.execute(req).await) })
                .await
        }
        (&Method::POST, "/v1/join_cluster") => {
            parse_request_body(req)
                .and_then(|req: MembershipRequest| async move {
                    reply(server.join_cluster(req.address).await.map(|_| ok()))
                })
                .await
        }
        (&Method::POST, "/v1/remove_member") => {
            parse_request_body(req)
                .and_then(|req: MembershipRequest| async move {
                    reply(server.remove_member(req.address).await.map(|_| ok()))
                })
                .await
        }
        (&Method::POST, "/v1/heartbeat_visibility") => {
            parse_request_body(req)
                .and_then(|req: VisibilityRequest| async move {
                    reply(
                        server
                            .set_heartbeat_visibility(req.visibility)
                            .await
                            .map(|_| ok()),
                    )
                })
                .await
        }
        (&Method::POST, "/v1/shutdown") => reply(server.shutdown().await.map(|_| ok())),
        (&Method::GET, "/v1/status") => reply(server.status().await),
        (&Method::GET, "/v1/ping") => reply(server.ping().await),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .map_err(HttpError::from),
    };
    match response {
        Ok(r) => r,
        Err(e) => {
            debug!("Failed to process request: {}", e);
            let status = match e {
                HttpError::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
                HttpError::Body(_) | HttpError::Json(_) => StatusCode::BAD_REQUEST,
            };
            let body = ErrorBody {
                error: e.to_string(),
                leader: None,
                address: None,
            };
            let mut response = Response::new(Body::from(
                serde_json::to_vec(&body).unwrap_or_default(),
            ));
            *response.status_mut() = status;
            response
        }
    }
}

fn ok() -> Ack {
    Ack { success: true }
}

fn reply<T: Serialize>(result: Result<T, RaftError>) -> Result<Response<Body>, HttpError> {
    match result {
        Ok(body) => make_response_body(StatusCode::OK, &body),
        Err(e) => {
            let status = match e {
                RaftError::NotLeader { .. } => StatusCode::FORBIDDEN,
                RaftError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
                RaftError::MembershipChangeInProgress => StatusCode::CONFLICT,
                RaftError::ProtocolTerminated => StatusCode::SERVICE_UNAVAILABLE,
            };
            make_response_body(status, &ErrorBody::from(&e))
        }
    }
}

async fn parse_request_body<T>(req: Request<Body>) -> Result<T, HttpError>
where
    T: DeserializeOwned,
{
    let data = hyper::body::to_bytes(req.into_body()).await?;
    let body = serde_json::from_slice(&data)?;
    Ok(body)
}

fn make_response_body<T>(status: StatusCode, body: &T) -> Result<Response<Body>, HttpError>
where
    T: Serialize,
{
    let body = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))?)
}

/// POSTs `request` as JSON to `http://{peer_address}/v1/{method_name}`.
pub(crate) async fn send_request<S, D>(
    client: &Client<HttpConnector>,
    peer_address: &str,
    method_name: &str,
    request: &S,
) -> Result<D, ClientError>
where
    S: Serialize + ?Sized,
    D: DeserializeOwned,
{
    trace!("{}: sending request to {}", method_name, peer_address);
    let body = serde_json::to_vec(request)?;
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/v1/{}", peer_address, method_name))
        .header("content-type", "application/json")
        .body(Body::from(body))?;
    read_response(client, peer_address, method_name, req).await
}

/// GETs `http://{address}/v1/{method_name}`.
pub(crate) async fn send_get<D>(
    client: &Client<HttpConnector>,
    address: &str,
    method_name: &str,
) -> Result<D, ClientError>
where
    D: DeserializeOwned,
{
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/v1/{}", address, method_name))
        .body(Body::empty())?;
    read_response(client, address, method_name, req).await
}

async fn read_response<D>(
    client: &Client<HttpConnector>,
    address: &str,
    method_name: &str,
    req: Request<Body>,
) -> Result<D, ClientError>
where
    D: DeserializeOwned,
{
    let resp = client.request(req).await?;
    let status = resp.status();
    trace!("{}: response status {}", method_name, status);
    let bytes = hyper::body::to_bytes(resp.into_body()).await?;
    if !status.is_success() {
        debug!(
            "{}: server {} failed with status {}",
            method_name, address, status
        );
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: serde_json::from_slice(&bytes).ok(),
        });
    }
    Ok(serde_json::from_reader(bytes.reader())?)
}
