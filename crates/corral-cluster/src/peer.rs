//! Peer protocol client.
//!
//! Members talk to each other over plain HTTP/1.1 with JSON bodies. Every
//! request names its sender and the fingerprint of the sender's
//! certificate, and once the cluster key is known it is signed with it
//! (see [`crate::auth`]); the receiving side checks all three.
//! Failed responses carry an [`ApiResponse`] error envelope, which is
//! decoded back into the same [`ClusterError`] kind so that errors
//! forwarded from the leader reach the original caller unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth;
pub use crate::auth::{FINGERPRINT_HEADER, MEMBER_HEADER};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{ApiResponse, JoinRequest, TokenResponse};

/// Upper bound on a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Who this node claims to be when it calls a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub name: String,
    pub fingerprint: String,
}

/// Operations one member invokes on another.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Forward a join request (`POST /cluster`).
    async fn add_cluster_member(
        &self,
        address: &str,
        request: &JoinRequest,
    ) -> ClusterResult<TokenResponse>;

    /// Forward a removal (`DELETE /cluster/{name}`).
    async fn delete_cluster_member(&self, address: &str, name: &str) -> ClusterResult<()>;

    /// Instruct a removed member to reset itself (`PUT /cluster/{name}`).
    async fn reset_cluster_member(&self, address: &str, name: &str) -> ClusterResult<()>;

    /// Liveness probe (`GET /ready`).
    async fn check_ready(&self, address: &str) -> ClusterResult<()>;
}

/// One-shot HTTP/1.1 requests to a peer, authenticated by identity headers.
///
/// Clones share the cluster key, so a key installed after bootstrap or
/// join reaches every client built from this transport.
#[derive(Clone)]
pub struct HttpTransport {
    identity: PeerIdentity,
    cluster_key: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("identity", &self.identity)
            .field("signing", &self.cluster_key.read().is_some())
            .finish()
    }
}

impl HttpTransport {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            cluster_key: Arc::default(),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Sign every following request with `key`.
    pub fn set_cluster_key(&self, key: impl Into<String>) {
        *self.cluster_key.write() = Some(key.into());
    }

    fn identity_headers(&self, method: &Method, path: &str) -> ClusterResult<Vec<(&'static str, String)>> {
        let Some(key) = self.cluster_key.read().clone() else {
            return Ok(vec![
                (MEMBER_HEADER, self.identity.name.clone()),
                (FINGERPRINT_HEADER, self.identity.fingerprint.clone()),
            ]);
        };
        let headers = auth::signed_headers(
            &key,
            method,
            path,
            &self.identity.name,
            &self.identity.fingerprint,
            auth::unix_now(),
        )?;
        Ok(headers.into())
    }

    /// Send one request and collect the whole response body.
    ///
    /// Connection and protocol failures are reported as `Unavailable`.
    pub async fn send(
        &self,
        method: Method,
        address: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClusterResult<(StatusCode, Bytes)> {
        let uri = format!("http://{address}{path}");
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| unavailable("failed to connect to", &uri, e))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| unavailable("handshake failed with", &uri, e))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "peer connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(http::header::HOST, address)
            .header(http::header::USER_AGENT, "corral/0.1");
        for (name, value) in self.identity_headers(&method, path)? {
            builder = builder.header(name, value);
        }
        if body.is_some() {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ClusterError::Internal(format!("invalid peer request {uri}: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| unavailable("request failed to", &uri, e))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| unavailable("failed to read response from", &uri, e))?
            .to_bytes();

        debug!(%method, %uri, %status, "peer request completed");
        Ok((status, bytes))
    }

    /// Send a JSON body (if any) and decode the response envelope.
    pub async fn call<B, T>(
        &self,
        method: Method,
        address: &str,
        path: &str,
        body: Option<&B>,
    ) -> ClusterResult<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| ClusterError::Internal(format!("failed to encode peer request: {e}")))?;
        let (status, bytes) = self.send(method, address, path, body).await?;

        match serde_json::from_slice::<ApiResponse<T>>(&bytes) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if status.is_success() => Ok(None),
            Err(e) => Err(ClusterError::Unavailable(format!(
                "peer {address} answered {status} with an unreadable body: {e}"
            ))),
        }
    }
}

/// [`PeerClient`] over [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    transport: HttpTransport,
}

impl HttpPeerClient {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

fn unavailable(what: &str, uri: &str, err: impl std::fmt::Display) -> ClusterError {
    ClusterError::Unavailable(format!("{what} {uri}: {err}"))
}

fn member_path(name: &str) -> String {
    format!("/cluster/{}", utf8_percent_encode(name, PATH_SEGMENT))
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn add_cluster_member(
        &self,
        address: &str,
        request: &JoinRequest,
    ) -> ClusterResult<TokenResponse> {
        self.transport
            .call(Method::POST, address, "/cluster", Some(request))
            .await?
            .ok_or_else(|| ClusterError::Internal(format!("{address} accepted the join without a token response")))
    }

    async fn delete_cluster_member(&self, address: &str, name: &str) -> ClusterResult<()> {
        self.transport
            .call::<(), serde_json::Value>(Method::DELETE, address, &member_path(name), None)
            .await
            .map(drop)
    }

    async fn reset_cluster_member(&self, address: &str, name: &str) -> ClusterResult<()> {
        self.transport
            .call::<(), serde_json::Value>(Method::PUT, address, &member_path(name), None)
            .await
            .map(drop)
    }

    async fn check_ready(&self, address: &str) -> ClusterResult<()> {
        let probe = self
            .transport
            .call::<(), serde_json::Value>(Method::GET, address, "/ready", None);
        match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(result) => result.map(drop),
            Err(_) => Err(ClusterError::Unavailable(format!(
                "{address} did not answer within {PROBE_TIMEOUT:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client() -> HttpPeerClient {
        HttpPeerClient::new(HttpTransport::new(PeerIdentity {
            name: "n1".into(),
            fingerprint: "abc123".into(),
        }))
    }

    /// Serve one canned response and hand back the raw request text.
    async fn one_shot(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let raw = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            raw
        });
        (address, handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length || n == 0 {
                    return text;
                }
            } else if n == 0 {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn requests_carry_identity_and_encoded_name() {
        let (address, server) = one_shot("200 OK", r#"{"success":true,"data":"deleted"}"#).await;
        client().delete_cluster_member(&address, "node a").await.unwrap();

        let raw = server.await.unwrap().to_ascii_lowercase();
        assert!(raw.starts_with("delete /cluster/node%20a http/1.1"));
        assert!(raw.contains("x-corral-member: n1"));
        assert!(raw.contains("x-corral-fingerprint: abc123"));
        assert!(!raw.contains("x-corral-signature"));
    }

    #[tokio::test]
    async fn requests_are_signed_once_the_cluster_key_is_known() {
        let transport = HttpTransport::new(PeerIdentity {
            name: "n1".into(),
            fingerprint: "abc123".into(),
        });
        let peer = HttpPeerClient::new(transport.clone());
        transport.set_cluster_key("cluster key");

        let (address, server) = one_shot("200 OK", r#"{"success":true,"data":"reset"}"#).await;
        peer.reset_cluster_member(&address, "n2").await.unwrap();

        let raw = server.await.unwrap();
        let mut headers = http::HeaderMap::new();
        for line in raw.lines().skip(1).take_while(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').unwrap();
            headers.insert(
                http::HeaderName::from_bytes(name.trim().as_bytes()).unwrap(),
                value.trim().parse().unwrap(),
            );
        }
        let (identity, signature) = auth::presented(&headers).unwrap();
        assert_eq!(identity.member, "n1");
        assert!(auth::verify(
            "cluster key",
            &Method::PUT,
            "/cluster/n2",
            &identity,
            signature,
            identity.timestamp,
        ));
        assert!(!auth::verify(
            "other key",
            &Method::PUT,
            "/cluster/n2",
            &identity,
            signature,
            identity.timestamp,
        ));
    }

    #[tokio::test]
    async fn remote_errors_keep_their_kind() {
        let (address, server) = one_shot(
            "412 Precondition Failed",
            r#"{"success":false,"error":{"kind":"quorum_violation","message":"cannot leave a cluster with 1 members"}}"#,
        )
        .await;

        let err = client().delete_cluster_member(&address, "n2").await.unwrap_err();
        assert_eq!(
            err,
            ClusterError::QuorumViolation("cannot leave a cluster with 1 members".into())
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_peer_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client().check_ready(&address).await.unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn forwarded_join_returns_token_response() {
        let body = r#"{"success":true,"data":{"cluster_cert":"C","cluster_key":"K","cluster_members":[{"name":"n1","address":"10.0.0.1:7443","certificate":"X"}]}}"#;
        let (address, server) = one_shot("200 OK", body).await;

        let request = JoinRequest {
            name: "n2".into(),
            address: "10.0.0.2:7443".into(),
            certificate: "Y".into(),
            secret: "s".into(),
            schema_version: 1,
        };
        let response = client().add_cluster_member(&address, &request).await.unwrap();
        assert_eq!(response.cluster_cert, "C");
        assert_eq!(response.cluster_members.len(), 1);

        let raw = server.await.unwrap();
        assert!(raw.contains(r#""secret":"s""#));
    }
}
