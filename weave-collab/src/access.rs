//! Connection authorization and live access revocation.
//!
//! ```text
//! upgrade request ──► AccessGate::authorize_connect ──► 401 (denied)
//!                              │
//!                              ▼ (allowed)
//!                     AccessGate::register ──► kick receiver per connection
//!                              ▲
//! revoke(project, user) ───────┘  every open connection of that user on that
//!                                 project receives a kick and closes with 4403
//! ```
//!
//! Identity, projects and folders belong to an external layer reached through
//! the narrow [`AccessDirectory`] trait.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::signals::{Signal, SignalHub};

/// Upper bound on the folder ancestry walk. Also stops cycles.
pub const MAX_FOLDER_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("missing credentials")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("unknown project {0}")]
    UnknownProject(Uuid),
    #[error("user {user_id} has no access to project {project_id}")]
    Forbidden { user_id: Uuid, project_id: Uuid },
    #[error("invalid document name: {0}")]
    InvalidDocumentName(String),
    #[error("directory error: {0}")]
    Directory(String),
}

// ─── Document names and credentials ───────────────────────────────

/// Addressable endpoint of the sync server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentName {
    /// `doc/<projectId>`: the project's replicated canvas.
    Canvas(Uuid),
    /// `lobby/<projectId>`: signals for the project.
    Lobby(Uuid),
}

impl DocumentName {
    /// Parse a request path such as `/doc/<uuid>?token=…`.
    pub fn parse(path: &str) -> Result<Self, AccessError> {
        let path = path.split('?').next().unwrap_or_default();
        let trimmed = path.trim_matches('/');
        let invalid = || AccessError::InvalidDocumentName(path.to_string());

        let (kind, id) = trimmed.split_once('/').ok_or_else(invalid)?;
        let project_id = Uuid::parse_str(id).map_err(|_| invalid())?;
        match kind {
            "doc" => Ok(DocumentName::Canvas(project_id)),
            "lobby" => Ok(DocumentName::Lobby(project_id)),
            _ => Err(invalid()),
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            DocumentName::Canvas(id) | DocumentName::Lobby(id) => *id,
        }
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentName::Canvas(id) => write!(f, "doc/{id}"),
            DocumentName::Lobby(id) => write!(f, "lobby/{id}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCredentials {
    pub token: Option<String>,
}

impl ConnectionCredentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Token from an `Authorization: Bearer` header, falling back to the
    /// `token=` query parameter.
    pub fn from_parts(query: Option<&str>, authorization: Option<&str>) -> Self {
        let token = authorization
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|s| s.trim().to_string())
            .or_else(|| {
                query.and_then(|q| {
                    q.split('&')
                        .find_map(|p| p.strip_prefix("token="))
                        .map(str::to_string)
                })
            })
            .filter(|t| !t.is_empty());
        Self { token }
    }
}

// ─── Directory contract ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub folder_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub parent_id: Option<Uuid>,
}

/// Read-only view of the external identity and project layer.
pub trait AccessDirectory: Send + Sync {
    fn resolve_token(&self, token: &str) -> Option<AuthenticatedUser>;
    fn project(&self, project_id: Uuid) -> Option<ProjectEntry>;
    fn folder(&self, folder_id: Uuid) -> Option<FolderEntry>;
    fn is_project_collaborator(&self, project_id: Uuid, user_id: Uuid) -> bool;
    fn is_folder_collaborator(&self, folder_id: Uuid, user_id: Uuid) -> bool;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<UserRow>,
    #[serde(default)]
    projects: Vec<ProjectRow>,
    #[serde(default)]
    folders: Vec<FolderRow>,
}

#[derive(Debug, Deserialize)]
struct UserRow {
    token: String,
    user_id: Uuid,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectRow {
    id: Uuid,
    owner_id: Uuid,
    #[serde(default)]
    folder_id: Option<Uuid>,
    #[serde(default)]
    collaborators: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct FolderRow {
    id: Uuid,
    owner_id: Uuid,
    #[serde(default)]
    parent_id: Option<Uuid>,
    #[serde(default)]
    collaborators: Vec<Uuid>,
}

#[derive(Default)]
struct DirectoryState {
    tokens: HashMap<String, AuthenticatedUser>,
    projects: HashMap<Uuid, ProjectEntry>,
    folders: HashMap<Uuid, FolderEntry>,
    project_collaborators: HashMap<Uuid, HashSet<Uuid>>,
    folder_collaborators: HashMap<Uuid, HashSet<Uuid>>,
}

/// In-process directory, mutable at runtime and loadable from JSON.
#[derive(Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, AccessError> {
        let file: DirectoryFile =
            serde_json::from_str(json).map_err(|e| AccessError::Directory(e.to_string()))?;
        let directory = Self::new();
        for user in file.users {
            directory.add_user(user.token, user.user_id, user.name);
        }
        for folder in file.folders {
            directory.add_folder(folder.id, folder.owner_id, folder.parent_id);
            for user_id in folder.collaborators {
                directory.add_folder_collaborator(folder.id, user_id);
            }
        }
        for project in file.projects {
            directory.add_project(project.id, project.owner_id, project.folder_id);
            for user_id in project.collaborators {
                directory.add_project_collaborator(project.id, user_id);
            }
        }
        Ok(directory)
    }

    pub fn load(path: &Path) -> Result<Self, AccessError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AccessError::Directory(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, token: impl Into<String>, user_id: Uuid, name: impl Into<String>) {
        self.write().tokens.insert(
            token.into(),
            AuthenticatedUser {
                user_id,
                name: name.into(),
            },
        );
    }

    pub fn add_project(&self, id: Uuid, owner_id: Uuid, folder_id: Option<Uuid>) {
        self.write().projects.insert(
            id,
            ProjectEntry {
                id,
                owner_id,
                folder_id,
            },
        );
    }

    pub fn add_folder(&self, id: Uuid, owner_id: Uuid, parent_id: Option<Uuid>) {
        self.write().folders.insert(
            id,
            FolderEntry {
                id,
                owner_id,
                parent_id,
            },
        );
    }

    pub fn add_project_collaborator(&self, project_id: Uuid, user_id: Uuid) {
        self.write()
            .project_collaborators
            .entry(project_id)
            .or_default()
            .insert(user_id);
    }

    pub fn remove_project_collaborator(&self, project_id: Uuid, user_id: Uuid) -> bool {
        self.write()
            .project_collaborators
            .get_mut(&project_id)
            .is_some_and(|set| set.remove(&user_id))
    }

    pub fn add_folder_collaborator(&self, folder_id: Uuid, user_id: Uuid) {
        self.write()
            .folder_collaborators
            .entry(folder_id)
            .or_default()
            .insert(user_id);
    }
}

impl AccessDirectory for MemoryDirectory {
    fn resolve_token(&self, token: &str) -> Option<AuthenticatedUser> {
        self.read().tokens.get(token).cloned()
    }

    fn project(&self, project_id: Uuid) -> Option<ProjectEntry> {
        self.read().projects.get(&project_id).cloned()
    }

    fn folder(&self, folder_id: Uuid) -> Option<FolderEntry> {
        self.read().folders.get(&folder_id).cloned()
    }

    fn is_project_collaborator(&self, project_id: Uuid, user_id: Uuid) -> bool {
        self.read()
            .project_collaborators
            .get(&project_id)
            .is_some_and(|set| set.contains(&user_id))
    }

    fn is_folder_collaborator(&self, folder_id: Uuid, user_id: Uuid) -> bool {
        self.read()
            .folder_collaborators
            .get(&folder_id)
            .is_some_and(|set| set.contains(&user_id))
    }
}

// ─── Gate ─────────────────────────────────────────────────────────

/// Sent to a connection whose access was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRevoked;

/// Handle of a registered connection, returned by [`AccessGate::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTicket {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub id: u64,
}

type KickSenders = HashMap<u64, mpsc::UnboundedSender<AccessRevoked>>;

pub struct AccessGate {
    directory: Arc<dyn AccessDirectory>,
    signals: Arc<SignalHub>,
    connections: Mutex<HashMap<(Uuid, Uuid), KickSenders>>,
    next_id: AtomicU64,
}

impl AccessGate {
    pub fn new(directory: Arc<dyn AccessDirectory>, signals: Arc<SignalHub>) -> Self {
        Self {
            directory,
            signals,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn signals(&self) -> &Arc<SignalHub> {
        &self.signals
    }

    pub fn authenticate(&self, credentials: &ConnectionCredentials) -> Result<AuthenticatedUser, AccessError> {
        let token = credentials.token.as_deref().ok_or(AccessError::MissingToken)?;
        self.directory
            .resolve_token(token)
            .ok_or(AccessError::InvalidToken)
    }

    /// Decide whether a connection to `document` may be upgraded.
    pub fn authorize_connect(
        &self,
        credentials: &ConnectionCredentials,
        document: &DocumentName,
    ) -> Result<AuthenticatedUser, AccessError> {
        let user = self.authenticate(credentials)?;
        match document {
            DocumentName::Canvas(project_id) => {
                self.authorize_project(user.user_id, *project_id)?;
            }
            DocumentName::Lobby(project_id) => {
                if self.directory.project(*project_id).is_none() {
                    return Err(AccessError::UnknownProject(*project_id));
                }
            }
        }
        Ok(user)
    }

    /// Owner, direct collaborator, or collaborator on any ancestor folder.
    pub fn authorize_project(&self, user_id: Uuid, project_id: Uuid) -> Result<(), AccessError> {
        let project = self
            .directory
            .project(project_id)
            .ok_or(AccessError::UnknownProject(project_id))?;
        if project.owner_id == user_id || self.directory.is_project_collaborator(project_id, user_id) {
            return Ok(());
        }

        let mut folder_id = project.folder_id;
        let mut depth = 0;
        while let Some(id) = folder_id {
            if depth >= MAX_FOLDER_DEPTH {
                log::warn!("Folder walk for project {project_id} hit the depth limit");
                break;
            }
            let Some(folder) = self.directory.folder(id) else {
                break;
            };
            if folder.owner_id == user_id || self.directory.is_folder_collaborator(id, user_id) {
                return Ok(());
            }
            folder_id = folder.parent_id;
            depth += 1;
        }

        Err(AccessError::Forbidden {
            user_id,
            project_id,
        })
    }

    pub fn authorize_owner(&self, user_id: Uuid, project_id: Uuid) -> Result<(), AccessError> {
        let project = self
            .directory
            .project(project_id)
            .ok_or(AccessError::UnknownProject(project_id))?;
        if project.owner_id == user_id {
            Ok(())
        } else {
            Err(AccessError::Forbidden {
                user_id,
                project_id,
            })
        }
    }

    /// Track an open canvas connection so it can be kicked on revocation.
    pub fn register(
        &self,
        project_id: Uuid,
        user_id: Uuid,
    ) -> (ConnectionTicket, mpsc::UnboundedReceiver<AccessRevoked>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((project_id, user_id))
            .or_default()
            .insert(id, tx);
        (
            ConnectionTicket {
                project_id,
                user_id,
                id,
            },
            rx,
        )
    }

    pub fn unregister(&self, ticket: &ConnectionTicket) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (ticket.project_id, ticket.user_id);
        if let Some(senders) = connections.get_mut(&key) {
            senders.remove(&ticket.id);
            if senders.is_empty() {
                connections.remove(&key);
            }
        }
    }

    /// Kick every open connection of `user_id` on `project_id`.
    /// Returns how many connections were told to close.
    pub fn revoke(&self, project_id: Uuid, user_id: Uuid) -> usize {
        let senders = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(project_id, user_id))
            .unwrap_or_default();
        let kicked = senders
            .values()
            .filter(|tx| tx.send(AccessRevoked).is_ok())
            .count();
        log::info!("Revoked access of {user_id} to {project_id}: {kicked} connection(s) closing");
        kicked
    }

    pub fn grant(&self, project_id: Uuid, user_id: Uuid) -> usize {
        log::info!("Access to {project_id} granted to {user_id}");
        self.signals
            .publish(project_id, Signal::AccessGranted { user_id })
    }

    pub fn set_pending_request_count(&self, project_id: Uuid, count: u32) -> usize {
        self.signals.set_pending(project_id, count)
    }

    pub fn pending_request_count(&self, project_id: Uuid) -> u32 {
        self.signals.pending(project_id)
    }

    pub fn subscribe_signals(&self, project_id: Uuid) -> broadcast::Receiver<Signal> {
        self.signals.subscribe(project_id)
    }

    pub fn unsubscribe_signals(&self, project_id: Uuid, receiver: broadcast::Receiver<Signal>) {
        self.signals.unsubscribe(project_id, receiver);
    }

    pub fn open_connections(&self, project_id: Uuid, user_id: Uuid) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(project_id, user_id))
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        gate: AccessGate,
        owner: Uuid,
        project: Uuid,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let owner = Uuid::new_v4();
        let project = Uuid::new_v4();
        directory.add_user("owner-token", owner, "Owner");
        directory.add_project(project, owner, None);
        let gate = AccessGate::new(directory.clone(), Arc::new(SignalHub::default()));
        Fixture {
            directory,
            gate,
            owner,
            project,
        }
    }

    #[test]
    fn test_parse_document_names() {
        let id = Uuid::new_v4();
        assert_eq!(DocumentName::parse(&format!("/doc/{id}")).unwrap(), DocumentName::Canvas(id));
        assert_eq!(
            DocumentName::parse(&format!("/lobby/{id}?token=abc")).unwrap(),
            DocumentName::Lobby(id)
        );
        assert_eq!(DocumentName::Canvas(id).to_string(), format!("doc/{id}"));
        assert!(DocumentName::parse("/doc/not-a-uuid").is_err());
        assert!(DocumentName::parse(&format!("/other/{id}")).is_err());
        assert!(DocumentName::parse("/").is_err());
    }

    #[test]
    fn test_credentials_header_then_query() {
        let both = ConnectionCredentials::from_parts(Some("a=1&token=q"), Some("Bearer h"));
        assert_eq!(both.token.as_deref(), Some("h"));
        let query = ConnectionCredentials::from_parts(Some("a=1&token=q"), None);
        assert_eq!(query.token.as_deref(), Some("q"));
        let none = ConnectionCredentials::from_parts(Some("token="), None);
        assert!(none.token.is_none());
    }

    #[test]
    fn test_owner_and_collaborator_allowed() {
        let f = fixture();
        let doc = DocumentName::Canvas(f.project);
        let user = f
            .gate
            .authorize_connect(&ConnectionCredentials::bearer("owner-token"), &doc)
            .unwrap();
        assert_eq!(user.user_id, f.owner);

        let collaborator = Uuid::new_v4();
        f.directory.add_user("c-token", collaborator, "C");
        assert!(matches!(
            f.gate.authorize_connect(&ConnectionCredentials::bearer("c-token"), &doc),
            Err(AccessError::Forbidden { .. })
        ));
        f.directory.add_project_collaborator(f.project, collaborator);
        assert!(f
            .gate
            .authorize_connect(&ConnectionCredentials::bearer("c-token"), &doc)
            .is_ok());
    }

    #[test]
    fn test_bad_credentials_denied() {
        let f = fixture();
        let doc = DocumentName::Canvas(f.project);
        assert!(matches!(
            f.gate.authorize_connect(&ConnectionCredentials::default(), &doc),
            Err(AccessError::MissingToken)
        ));
        assert!(matches!(
            f.gate.authorize_connect(&ConnectionCredentials::bearer("nope"), &doc),
            Err(AccessError::InvalidToken)
        ));
        assert!(matches!(
            f.gate.authorize_connect(
                &ConnectionCredentials::bearer("owner-token"),
                &DocumentName::Canvas(Uuid::new_v4())
            ),
            Err(AccessError::UnknownProject(_))
        ));
    }

    #[test]
    fn test_ancestor_folder_grants_access() {
        let f = fixture();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        let project = Uuid::new_v4();
        let member = Uuid::new_v4();
        f.directory.add_user("m-token", member, "M");
        f.directory.add_folder(root, f.owner, None);
        f.directory.add_folder(child, f.owner, Some(root));
        f.directory.add_project(project, f.owner, Some(child));
        f.directory.add_folder_collaborator(root, member);

        assert!(f.gate.authorize_project(member, project).is_ok());
    }

    #[test]
    fn test_folder_cycle_terminates() {
        let f = fixture();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let project = Uuid::new_v4();
        f.directory.add_folder(a, f.owner, Some(b));
        f.directory.add_folder(b, f.owner, Some(a));
        f.directory.add_project(project, f.owner, Some(a));

        assert!(f.gate.authorize_project(Uuid::new_v4(), project).is_err());
    }

    #[test]
    fn test_lobby_requires_existing_project_only() {
        let f = fixture();
        let stranger = Uuid::new_v4();
        f.directory.add_user("s-token", stranger, "S");
        let creds = ConnectionCredentials::bearer("s-token");
        assert!(f.gate.authorize_connect(&creds, &DocumentName::Lobby(f.project)).is_ok());
        assert!(f
            .gate
            .authorize_connect(&creds, &DocumentName::Lobby(Uuid::new_v4()))
            .is_err());
    }

    #[tokio::test]
    async fn test_revoke_kicks_every_connection_of_user() {
        let f = fixture();
        let user = Uuid::new_v4();
        let (_t1, mut rx1) = f.gate.register(f.project, user);
        let (_t2, mut rx2) = f.gate.register(f.project, user);
        let (_t3, mut other) = f.gate.register(f.project, f.owner);

        assert_eq!(f.gate.revoke(f.project, user), 2);
        assert_eq!(rx1.recv().await, Some(AccessRevoked));
        assert_eq!(rx2.recv().await, Some(AccessRevoked));
        assert!(other.try_recv().is_err());
        assert_eq!(f.gate.open_connections(f.project, user), 0);
    }

    #[test]
    fn test_unregister() {
        let f = fixture();
        let (ticket, _rx) = f.gate.register(f.project, f.owner);
        assert_eq!(f.gate.open_connections(f.project, f.owner), 1);
        f.gate.unregister(&ticket);
        assert_eq!(f.gate.open_connections(f.project, f.owner), 0);
        assert_eq!(f.gate.revoke(f.project, f.owner), 0);
    }

    #[tokio::test]
    async fn test_grant_and_pending_signals() {
        let f = fixture();
        let mut rx = f.gate.subscribe_signals(f.project);
        let user = Uuid::new_v4();

        assert_eq!(f.gate.grant(f.project, user), 1);
        assert_eq!(rx.recv().await.unwrap(), Signal::AccessGranted { user_id: user });

        f.gate.set_pending_request_count(f.project, 2);
        assert_eq!(f.gate.pending_request_count(f.project), 2);
        assert_eq!(rx.recv().await.unwrap(), Signal::PendingRequests { count: 2 });
    }

    #[test]
    fn test_directory_from_json() {
        let owner = Uuid::new_v4();
        let project = Uuid::new_v4();
        let json = format!(
            r#"{{"users":[{{"token":"t","user_id":"{owner}","name":"O"}}],
                "projects":[{{"id":"{project}","owner_id":"{owner}"}}]}}"#
        );
        let directory = MemoryDirectory::from_json(&json).unwrap();
        assert_eq!(directory.resolve_token("t").unwrap().user_id, owner);
        assert_eq!(directory.project(project).unwrap().owner_id, owner);
        assert!(MemoryDirectory::from_json("not json").is_err());
    }
}
