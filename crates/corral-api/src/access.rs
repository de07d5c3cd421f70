//! Peer access control.
//!
//! Trusted routes accept requests that arrived on the local control
//! socket (operator administration) and requests signed with the cluster
//! key by a trusted remote whose certificate fingerprint matches. Nothing
//! is granted by the caller's network address.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json, Router};
use tracing::debug;

use corral_cluster::auth;
use corral_cluster::{ApiResponse, ClusterError};
use corral_state::{TrustStore, fingerprint};

use crate::ApiState;

/// Marks requests received on the local control socket.
#[derive(Debug, Clone, Copy)]
pub struct ControlSocket;

/// Tag every request served by `router` as coming from the control socket.
pub fn with_control_socket(router: Router) -> Router {
    router.layer(Extension(ControlSocket))
}

/// Whether a peer request may use trusted routes.
///
/// The named member must be trusted, present its certificate's
/// fingerprint, and sign the request with `cluster_key` within the
/// tolerated clock skew of `now`.
pub fn allow_authenticated(
    trust: &TrustStore,
    cluster_key: &str,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    now: u64,
) -> bool {
    let Some((identity, signature)) = auth::presented(headers) else {
        return false;
    };
    let trusted = trust
        .by_name(identity.member)
        .is_some_and(|remote| fingerprint(&remote.certificate) == identity.fingerprint);
    trusted && auth::verify(cluster_key, method, path, &identity, signature, now)
}

/// Middleware rejecting untrusted callers with `403`.
pub async fn require_trusted(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    if request.extensions().get::<ControlSocket>().is_some() {
        return next.run(request).await;
    }

    let allowed = allow_authenticated(
        &state.ctx.trust,
        &state.ctx.cluster_cert.key_pem,
        request.method(),
        request.uri().path(),
        request.headers(),
        auth::unix_now(),
    );
    if allowed {
        return next.run(request).await;
    }

    debug!(method = %request.method(), path = %request.uri().path(), "rejected untrusted request");
    let denied = ClusterError::BadRequest("request is not from a trusted cluster member".into());
    (StatusCode::FORBIDDEN, Json(ApiResponse::<()>::failure(&denied))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_cluster::auth::{FINGERPRINT_HEADER, MEMBER_HEADER};
    use corral_cluster::testing::{certificate, remote};

    const KEY: &str = "cluster key";
    const NOW: u64 = 1_700_000_000;

    fn trust() -> TrustStore {
        let trust = TrustStore::open_in_memory().unwrap();
        trust.add(remote("b", "10.0.0.2:7443")).unwrap();
        trust
    }

    fn signed(key: &str, name: &str, fp: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (header, value) in auth::signed_headers(key, &Method::GET, "/cluster", name, fp, NOW).unwrap() {
            headers.insert(header, value.parse().unwrap());
        }
        headers
    }

    fn allowed(headers: &HeaderMap) -> bool {
        allow_authenticated(&trust(), KEY, &Method::GET, "/cluster", headers, NOW)
    }

    #[test]
    fn signed_trusted_member_is_allowed() {
        let headers = signed(KEY, "b", &fingerprint(&certificate("b")));
        assert!(allowed(&headers));
    }

    #[test]
    fn public_certificate_data_alone_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(MEMBER_HEADER, "b".parse().unwrap());
        headers.insert(FINGERPRINT_HEADER, fingerprint(&certificate("b")).parse().unwrap());
        assert!(!allowed(&headers));

        let forged = signed("guessed key", "b", &fingerprint(&certificate("b")));
        assert!(!allowed(&forged));
    }

    #[test]
    fn mismatched_or_unknown_identities_are_rejected() {
        let wrong = signed(KEY, "b", &fingerprint(&certificate("mallory")));
        assert!(!allowed(&wrong));

        let unknown = signed(KEY, "mallory", &fingerprint(&certificate("mallory")));
        assert!(!allowed(&unknown));

        assert!(!allowed(&HeaderMap::new()));
    }

    #[test]
    fn signatures_do_not_carry_over_to_other_routes() {
        let headers = signed(KEY, "b", &fingerprint(&certificate("b")));
        assert!(!allow_authenticated(
            &trust(),
            KEY,
            &Method::DELETE,
            "/cluster/b",
            &headers,
            NOW
        ));
    }
}
