//! The HTTP surface driven end to end through the router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::routing::post;
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use corral_api::{ControlSocket, build_router};
use corral_cluster::auth::{self, FINGERPRINT_HEADER, MEMBER_HEADER};
use corral_cluster::testing::{MemoryConsensus, TestNode, certificate, member, remote};
use corral_cluster::{ClusterError, ConsensusRole, Delivery};
use corral_state::{Role, TokenRecord, fingerprint};

const A: &str = "10.0.0.1:7443";
const B: &str = "10.0.0.2:7443";
const C: &str = "10.0.0.3:7443";

fn router(node: &TestNode) -> Router {
    let internal = Router::new().route("/internal/raft/vote", post(|| async { "{}" }));
    build_router(node.ctx.clone(), internal)
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let body = body.map_or_else(Body::empty, |v| Body::from(v.to_string()));
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap()
}

/// A request from the local administrator, over the control socket.
fn local(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut req = request(method, uri, body);
    req.extensions_mut().insert(ControlSocket);
    req
}

/// A request from the network with no credentials.
fn remote_request(method: Method, uri: &str) -> Request<Body> {
    request(method, uri, None)
}

/// A request from member `name`, signed with `key`.
fn signed_request(method: Method, uri: &str, name: &str, key: &str) -> Request<Body> {
    let mut req = request(method.clone(), uri, None);
    let headers = auth::signed_headers(
        key,
        &method,
        uri,
        name,
        &fingerprint(&certificate(name)),
        auth::unix_now(),
    )
    .unwrap();
    for (header, value) in headers {
        req.headers_mut().insert(header, value.parse().unwrap());
    }
    req
}

async fn json_body(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn join_body(name: &str, address: &str, secret: &str) -> Value {
    json!({
        "name": name,
        "address": address,
        "certificate": certificate(name),
        "secret": secret,
        "schema_version": 1,
    })
}

async fn issue_token(node: &TestNode, name: &str, secret: &str) {
    let token = TokenRecord {
        name: name.into(),
        secret: secret.into(),
        expires_at: 0,
    };
    node.ctx
        .database
        .transaction(|tx| tx.create_token_record(token))
        .await
        .unwrap();
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn ready_is_open() {
    let node = TestNode::bootstrap("a", A).await;
    let resp = router(&node)
        .oneshot(remote_request(Method::GET, "/ready"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp.into_body()).await["success"], true);
}

#[tokio::test]
async fn trusted_routes_reject_unknown_callers() {
    let node = TestNode::bootstrap("a", A).await;
    for (method, uri) in [
        (Method::GET, "/cluster"),
        (Method::DELETE, "/cluster/a"),
        (Method::PUT, "/cluster/a"),
        (Method::POST, "/internal/raft/vote"),
    ] {
        let resp = router(&node)
            .oneshot(remote_request(method.clone(), uri))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{method} {uri}");
    }
    assert!(!node.consensus.is_stopped());
}

#[tokio::test]
async fn trusted_peer_reaches_internal_routes() {
    let node = TestNode::bootstrap("a", A).await;
    node.ctx.trust.add(remote("b", B)).unwrap();

    let key = node.ctx.cluster_cert.key_pem.clone();
    let req = signed_request(Method::POST, "/internal/raft/vote", "b", &key);
    let resp = router(&node).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = signed_request(Method::GET, "/cluster", "b", &key);
    let resp = router(&node).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn public_certificate_headers_do_not_grant_access() {
    let node = TestNode::bootstrap("a", A).await;
    node.ctx.trust.add(remote("b", B)).unwrap();

    // Name and fingerprint are derivable from b's public certificate.
    let mut req = remote_request(Method::GET, "/cluster");
    req.headers_mut().insert(MEMBER_HEADER, "b".parse().unwrap());
    req.headers_mut().insert(
        FINGERPRINT_HEADER,
        fingerprint(&certificate("b")).parse().unwrap(),
    );
    let resp = router(&node).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = signed_request(Method::GET, "/cluster", "b", "not the cluster key");
    let resp = router(&node).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn join_then_list_shows_pending_member() {
    let node = TestNode::bootstrap("a", A).await;
    issue_token(&node, "b", "join-b").await;

    let resp = router(&node)
        .oneshot(request(Method::POST, "/cluster", Some(join_body("b", B, "join-b"))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp.into_body()).await;
    let mut names: Vec<&str> = body["data"]["cluster_members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(body["data"]["cluster_cert"], certificate("cluster"));

    let resp = router(&node)
        .oneshot(local(Method::GET, "/cluster", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp.into_body()).await;
    let b = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "b")
        .cloned()
        .unwrap();
    assert_eq!(b["role"], "pending");
    assert_eq!(b["status"], "not_responding");
}

#[tokio::test]
async fn join_errors_carry_their_kind() {
    let node = TestNode::bootstrap("a", A).await;
    issue_token(&node, "b", "join-b").await;

    let cases = [
        (join_body("a2", A, "join-b"), StatusCode::CONFLICT, "conflict"),
        (join_body("b", B, "wrong"), StatusCode::FORBIDDEN, "invalid_token"),
        (json!({"name": "b"}), StatusCode::BAD_REQUEST, "bad_request"),
    ];
    for (payload, status, kind) in cases {
        let resp = router(&node)
            .oneshot(request(Method::POST, "/cluster", Some(payload)))
            .await
            .unwrap();
        assert_eq!(resp.status(), status);
        let body = json_body(resp.into_body()).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], kind);
    }
    assert!(node.ctx.database.store().get_member(B).unwrap().is_none());
}

#[tokio::test]
async fn removing_a_ghost_is_not_found() {
    let node = TestNode::bootstrap("a", A).await;
    let resp = router(&node)
        .oneshot(local(Method::DELETE, "/cluster/ghost", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp.into_body()).await;
    assert_eq!(body["error"]["kind"], "not_found");
    assert!(node.consensus.calls().is_empty());
}

#[tokio::test]
async fn removing_the_last_member_violates_quorum() {
    let node = TestNode::bootstrap("a", A).await;
    let resp = router(&node)
        .oneshot(local(Method::DELETE, "/cluster/a", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    let body = json_body(resp.into_body()).await;
    assert_eq!(body["error"]["kind"], "quorum_violation");
}

#[tokio::test]
async fn reset_for_another_member_is_rejected() {
    let node = TestNode::bootstrap("a", A).await;
    let resp = router(&node)
        .oneshot(local(Method::PUT, "/cluster/b", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!node.consensus.is_stopped());
}

#[tokio::test]
async fn reset_restarts_after_its_response_is_read() {
    let node = TestNode::bootstrap("a", A).await;
    let resp = router(&node)
        .oneshot(local(Method::PUT, "/cluster/a", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(node.consensus.is_stopped());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.replacer.count(), 0);

    assert_eq!(json_body(resp.into_body()).await["success"], true);
    node.replacer.wait(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn reset_forgets_every_trusted_member() {
    let node = TestNode::bootstrap("a", A).await;
    node.ctx.trust.add(remote("b", B)).unwrap();
    assert_eq!(node.ctx.trust.count(), 2);

    let key = node.ctx.cluster_cert.key_pem.clone();
    let resp = router(&node)
        .oneshot(signed_request(Method::PUT, "/cluster/a", "b", &key))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    json_body(resp.into_body()).await;
    node.replacer.wait(Duration::from_secs(1)).await;
    assert_eq!(node.ctx.trust.count(), 0);
}

#[tokio::test]
async fn follower_self_removal_answers_before_restarting() {
    let consensus = Arc::new(MemoryConsensus::with_nodes(
        &[(A, ConsensusRole::Voter), (B, ConsensusRole::Voter)],
        Some(A),
    ));
    let node = TestNode::with_consensus("b", B, consensus).await;
    node.ctx.trust.add(remote("a", A)).unwrap();

    // The leader removes b and immediately instructs it to reset; that
    // reset's own response is delivered straight away.
    let supervisor = node.ctx.supervisor.clone();
    node.peers.on_delete(move |_, _| {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let ticket = supervisor.arm_reset().await?;
            ticket.deliver(Delivery::Flushed);
            Ok::<_, ClusterError>(())
        });
        Ok(())
    });

    let resp = router(&node)
        .oneshot(local(Method::DELETE, "/cluster/b", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let consensus = node.consensus.clone();
    eventually("reset to be armed", move || consensus.is_stopped()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.ctx.supervisor.gate().is_held());
    assert_eq!(node.replacer.count(), 0, "restarted before the response was sent");

    let body = json_body(resp.into_body()).await;
    assert_eq!(body["data"]["name"], "b");
    node.replacer.wait(Duration::from_secs(1)).await;
    assert!(node.ctx.trust.by_name("b").is_none());
}

#[tokio::test]
async fn leader_self_removal_restarts_after_delivery() {
    let consensus = Arc::new(MemoryConsensus::with_nodes(
        &[
            (A, ConsensusRole::Voter),
            (B, ConsensusRole::Voter),
            (C, ConsensusRole::Voter),
        ],
        Some(A),
    ));
    let node = TestNode::with_consensus("a", A, consensus).await;
    let others = vec![member("b", B, Role::Voter), member("c", C, Role::Voter)];
    node.ctx
        .database
        .transaction(|tx| {
            for record in others {
                tx.create_cluster_member(record)?;
            }
            Ok::<_, ClusterError>(())
        })
        .await
        .unwrap();
    node.ctx.trust.add(remote("b", B)).unwrap();
    node.ctx.trust.add(remote("c", C)).unwrap();

    let resp = router(&node)
        .oneshot(local(Method::DELETE, "/cluster/a", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(node.consensus.nodes().len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.replacer.count(), 0);

    json_body(resp.into_body()).await;
    node.replacer.wait(Duration::from_secs(1)).await;
}
