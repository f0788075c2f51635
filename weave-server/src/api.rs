//! HTTP API for versioning and access signals.
//!
//! Every route except `/status` takes a bearer token (header or `token=`
//! query parameter) resolved through the [`AccessGate`].

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weave_collab::{
    AccessError, AccessGate, AuthenticatedUser, ConnectionCredentials, DocumentRegistry,
    MemoryDirectory, PersistenceStats, RegistryStats, SaveOutcome, ServerStats, SyncServer,
    VersionError, VersionService, VersionSummary,
};
use weave_core::Graph;

#[derive(Clone)]
pub struct ApiState {
    pub gate: Arc<AccessGate>,
    pub directory: Arc<MemoryDirectory>,
    pub versions: Arc<VersionService>,
    pub registry: Arc<DocumentRegistry>,
    pub server: Arc<SyncServer>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("version {0} not found")]
    NotFound(Uuid),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Access(AccessError::MissingToken | AccessError::InvalidToken) => StatusCode::UNAUTHORIZED,
            ApiError::Access(AccessError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            ApiError::Access(AccessError::UnknownProject(_)) | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Access(AccessError::InvalidDocumentName(_)) => StatusCode::BAD_REQUEST,
            ApiError::Version(VersionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Version(VersionError::VersionConflict(_))
            | ApiError::Version(VersionError::ReconstructionDepthExceeded(_)) => StatusCode::CONFLICT,
            ApiError::Access(AccessError::Directory(_))
            | ApiError::Version(VersionError::Store(_))
            | ApiError::Version(VersionError::Live(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("API request failed: {self}");
        } else {
            log::debug!("API request rejected ({status}): {self}");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Credentials carried by the request. Never rejects; authentication
/// happens in the handler so failures map through [`ApiError`].
#[derive(Debug, Clone)]
pub struct Bearer(pub ConnectionCredentials);

impl<S> FromRequestParts<S> for Bearer
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let authorization = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        Ok(Bearer(ConnectionCredentials::from_parts(parts.uri.query(), authorization)))
    }
}

impl ApiState {
    fn member(&self, bearer: &Bearer, project_id: Uuid) -> Result<AuthenticatedUser, ApiError> {
        let user = self.gate.authenticate(&bearer.0)?;
        self.gate.authorize_project(user.user_id, project_id)?;
        Ok(user)
    }

    fn owner(&self, bearer: &Bearer, project_id: Uuid) -> Result<AuthenticatedUser, ApiError> {
        let user = self.gate.authenticate(&bearer.0)?;
        self.gate.authorize_owner(user.user_id, project_id)?;
        Ok(user)
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route(
            "/projects/{project_id}/versions",
            get(list_versions).post(save_version),
        )
        .route("/projects/{project_id}/versions/{version_id}", get(get_version))
        .route(
            "/projects/{project_id}/versions/{version_id}/restore",
            post(restore_version),
        )
        .route("/versions/{version_id}/rename", post(rename_version))
        .route("/versions/{version_id}/delete", post(delete_version))
        .route("/projects/{project_id}/access/{user_id}/revoke", post(revoke_access))
        .route("/projects/{project_id}/access/{user_id}/grant", post(grant_access))
        .route(
            "/projects/{project_id}/access/pending",
            get(get_pending).put(put_pending),
        )
        .with_state(state)
}

// ─── Status ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub server: ServerStats,
    pub registry: RegistryStats,
    pub persistence: PersistenceStats,
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        server: state.server.stats(),
        registry: state.registry.stats().await,
        persistence: state.registry.gateway().stats(),
    })
}

// ─── Versions ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    pub graph: Graph,
    #[serde(default)]
    pub intent: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Created,
    Unchanged,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SaveResponse {
    pub status: SaveStatus,
    pub version_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct VersionIdResponse {
    pub version_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub intent: String,
}

async fn list_versions(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Vec<VersionSummary>> {
    state.member(&bearer, project_id)?;
    Ok(Json(state.versions.history(project_id)?))
}

async fn save_version(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path(project_id): Path<Uuid>,
    Json(request): Json<SaveRequest>,
) -> ApiResult<SaveResponse> {
    let user = state.member(&bearer, project_id)?;
    let outcome = state
        .versions
        .save(project_id, user.user_id, &request.graph, request.intent)
        .await?;
    let status = match outcome {
        SaveOutcome::Created(_) => SaveStatus::Created,
        SaveOutcome::Unchanged(_) => SaveStatus::Unchanged,
    };
    Ok(Json(SaveResponse {
        status,
        version_id: outcome.version_id(),
    }))
}

async fn get_version(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path((project_id, version_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Graph> {
    state.member(&bearer, project_id)?;
    if state.versions.get(version_id)?.project_id != project_id {
        return Err(ApiError::NotFound(version_id));
    }
    Ok(Json(state.versions.reconstruct(version_id)?))
}

async fn restore_version(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path((project_id, version_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<VersionIdResponse> {
    let user = state.member(&bearer, project_id)?;
    let version_id = state
        .versions
        .restore(project_id, version_id, user.user_id)
        .await?;
    Ok(Json(VersionIdResponse { version_id }))
}

async fn rename_version(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path(version_id): Path<Uuid>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<VersionIdResponse> {
    let project_id = state.versions.get(version_id)?.project_id;
    state.member(&bearer, project_id)?;
    state.versions.rename(version_id, request.intent).await?;
    Ok(Json(VersionIdResponse { version_id }))
}

async fn delete_version(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path(version_id): Path<Uuid>,
) -> ApiResult<VersionIdResponse> {
    let project_id = state.versions.get(version_id)?.project_id;
    state.owner(&bearer, project_id)?;
    state.versions.delete(version_id).await?;
    Ok(Json(VersionIdResponse { version_id }))
}

// ─── Access ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RevokeResponse {
    pub closed: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct GrantResponse {
    pub notified: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingCount {
    pub count: u32,
}

async fn revoke_access(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path((project_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<RevokeResponse> {
    state.owner(&bearer, project_id)?;
    state.directory.remove_project_collaborator(project_id, user_id);
    let closed = state.gate.revoke(project_id, user_id);
    Ok(Json(RevokeResponse { closed }))
}

async fn grant_access(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path((project_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<GrantResponse> {
    state.owner(&bearer, project_id)?;
    state.directory.add_project_collaborator(project_id, user_id);
    let notified = state.gate.grant(project_id, user_id);
    Ok(Json(GrantResponse { notified }))
}

async fn get_pending(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path(project_id): Path<Uuid>,
) -> ApiResult<PendingCount> {
    state.member(&bearer, project_id)?;
    Ok(Json(PendingCount {
        count: state.gate.pending_request_count(project_id),
    }))
}

async fn put_pending(
    State(state): State<ApiState>,
    bearer: Bearer,
    Path(project_id): Path<Uuid>,
    Json(body): Json<PendingCount>,
) -> ApiResult<PendingCount> {
    state.owner(&bearer, project_id)?;
    state.gate.set_pending_request_count(project_id, body.count);
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use weave_collab::{
        MemoryStore, PersistenceConfig, PersistenceGateway, RegistryConfig, ServerConfig,
        SignalHub, Storage,
    };
    use weave_core::{Block, BlockKind, Rect};

    struct Fixture {
        state: ApiState,
        project: Uuid,
        alice: Uuid,
        bob: Uuid,
    }

    fn fixture() -> Fixture {
        let project = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_user("alice", alice, "Alice");
        directory.add_user("bob", bob, "Bob");
        directory.add_project(project, alice, None);
        directory.add_project_collaborator(project, bob);

        let gate = Arc::new(AccessGate::new(directory.clone(), Arc::new(SignalHub::default())));
        let store: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let gateway = Arc::new(PersistenceGateway::new(store.clone(), PersistenceConfig::default()));
        let registry = Arc::new(DocumentRegistry::new(gateway, RegistryConfig::default()));
        let versions = Arc::new(VersionService::new(store).with_registry(registry.clone()));
        let server = Arc::new(SyncServer::new(ServerConfig::default(), gate.clone(), registry.clone()));

        Fixture {
            state: ApiState {
                gate,
                directory,
                versions,
                registry,
                server,
            },
            project,
            alice,
            bob,
        }
    }

    fn bearer(token: &str) -> Bearer {
        Bearer(ConnectionCredentials::bearer(token))
    }

    fn graph_with(id: &str) -> Graph {
        let mut graph = Graph::new();
        graph.blocks.push(Block::new(
            id,
            BlockKind::Note,
            Rect::new(800.0, 0.0, 200.0, 120.0),
            Uuid::nil(),
        ));
        graph
    }

    async fn save(f: &Fixture, token: &str, graph: Graph) -> Result<SaveResponse, ApiError> {
        let request = SaveRequest {
            graph,
            intent: "checkpoint".to_string(),
        };
        save_version(State(f.state.clone()), bearer(token), Path(f.project), Json(request))
            .await
            .map(|Json(r)| r)
    }

    #[tokio::test]
    async fn test_bearer_extraction() {
        let (mut parts, _) = Request::builder()
            .uri("/status?token=from-query")
            .header("authorization", "Bearer from-header")
            .body(())
            .unwrap()
            .into_parts();
        let Bearer(credentials) = Bearer::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(credentials.token.as_deref(), Some("from-header"));

        let (mut parts, _) = Request::builder()
            .uri("/status?token=from-query")
            .body(())
            .unwrap()
            .into_parts();
        let Bearer(credentials) = Bearer::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(credentials.token.as_deref(), Some("from-query"));
    }

    #[tokio::test]
    async fn test_save_then_unchanged() {
        let f = fixture();
        let first = save(&f, "bob", graph_with("b1")).await.unwrap();
        assert_eq!(first.status, SaveStatus::Created);

        let second = save(&f, "alice", graph_with("b1")).await.unwrap();
        assert_eq!(second.status, SaveStatus::Unchanged);
        assert_eq!(second.version_id, first.version_id);

        let Json(history) = list_versions(State(f.state.clone()), bearer("alice"), Path(f.project))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, f.bob);
        assert!(history[0].is_head);
    }

    #[tokio::test]
    async fn test_auth_failures_map_to_status() {
        let f = fixture();
        let err = save(&f, "nobody", graph_with("b1")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        f.state.directory.add_user("mallory", Uuid::new_v4(), "Mallory");
        let err = save(&f, "mallory", graph_with("b1")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let err = list_versions(State(f.state.clone()), Bearer(ConnectionCredentials::default()), Path(f.project))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_delete_head_is_conflict() {
        let f = fixture();
        let head = save(&f, "alice", graph_with("b1")).await.unwrap().version_id;

        let err = delete_version(State(f.state.clone()), bearer("alice"), Path(head))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        // Collaborators cannot delete at all.
        let err = delete_version(State(f.state.clone()), bearer("bob"), Path(head))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_get_and_restore() {
        let f = fixture();
        let first = save(&f, "alice", graph_with("b1")).await.unwrap().version_id;
        save(&f, "alice", graph_with("b2")).await.unwrap();

        let Json(graph) = get_version(State(f.state.clone()), bearer("bob"), Path((f.project, first)))
            .await
            .unwrap();
        assert!(graph.block("b1").is_some());

        let Json(restored) = restore_version(State(f.state.clone()), bearer("bob"), Path((f.project, first)))
            .await
            .unwrap();
        assert_ne!(restored.version_id, first);
        let live = f.state.registry.acquire(f.project).await.unwrap();
        assert!(live.graph().block("b1").is_some());
        assert!(live.graph().block("b2").is_none());

        // A version of another project is not reachable through this one.
        let other = Uuid::new_v4();
        f.state.directory.add_project(other, f.alice, None);
        let err = get_version(State(f.state.clone()), bearer("alice"), Path((other, first)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rename() {
        let f = fixture();
        let id = save(&f, "alice", graph_with("b1")).await.unwrap().version_id;
        let request = RenameRequest {
            intent: "Before launch".to_string(),
        };
        rename_version(State(f.state.clone()), bearer("bob"), Path(id), Json(request))
            .await
            .unwrap();
        assert_eq!(f.state.versions.get(id).unwrap().intent, "Before launch");

        let missing = Uuid::new_v4();
        let request = RenameRequest {
            intent: "x".to_string(),
        };
        let err = rename_version(State(f.state.clone()), bearer("bob"), Path(missing), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_revoke_and_grant_are_owner_only() {
        let f = fixture();
        let err = revoke_access(State(f.state.clone()), bearer("bob"), Path((f.project, f.alice)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let Json(revoked) = revoke_access(State(f.state.clone()), bearer("alice"), Path((f.project, f.bob)))
            .await
            .unwrap();
        assert_eq!(revoked.closed, 0);
        assert!(f.state.gate.authorize_project(f.bob, f.project).is_err());

        let mut signals = f.state.gate.subscribe_signals(f.project);
        let Json(granted) = grant_access(State(f.state.clone()), bearer("alice"), Path((f.project, f.bob)))
            .await
            .unwrap();
        assert_eq!(granted.notified, 1);
        assert!(f.state.gate.authorize_project(f.bob, f.project).is_ok());
        assert_eq!(
            signals.recv().await.unwrap(),
            weave_collab::Signal::AccessGranted { user_id: f.bob }
        );
    }

    #[tokio::test]
    async fn test_pending_count() {
        let f = fixture();
        put_pending(
            State(f.state.clone()),
            bearer("alice"),
            Path(f.project),
            Json(PendingCount { count: 3 }),
        )
        .await
        .unwrap();

        let Json(pending) = get_pending(State(f.state.clone()), bearer("bob"), Path(f.project))
            .await
            .unwrap();
        assert_eq!(pending, PendingCount { count: 3 });
    }

    #[tokio::test]
    async fn test_status_reports_stats() {
        let f = fixture();
        f.state.registry.acquire(f.project).await.unwrap();
        let Json(status) = get_status(State(f.state.clone())).await;
        assert_eq!(status.status, "ok");
        assert_eq!(status.registry.resident_documents, 1);
        assert_eq!(status.server.active_connections, 0);
    }
}
