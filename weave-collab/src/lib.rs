//! # weave-collab: server and network side of the Weave canvas
//!
//! ```text
//! ┌─────────────┐   WebSocket + bearer   ┌──────────────┐     ┌──────────────┐
//! │ SyncClient  │ ◄────────────────────► │ SyncServer   │ ──► │ AccessGate   │
//! │ (per user)  │   bincode SyncMessage  │              │     │ + SignalHub  │
//! └──────┬──────┘                        └──────┬───────┘     └──────────────┘
//!        │                                      ▼
//!        ▼                              ┌──────────────────┐   ┌────────────────────┐
//! ┌─────────────┐                       │ DocumentRegistry │──►│ PersistenceGateway │
//! │ CanvasStore │                       │ (LiveDocument)   │   └─────────┬──────────┘
//! │ (weave-core)│                       └──────┬───────────┘             ▼
//! └─────────────┘                              │               ┌──────────────────┐
//!                                       BroadcastGroup         │ Storage (RocksDB │
//!                                                              │ or in-memory)    │
//!                                       VersionService ──────► └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: per-document fan-out with backpressure
//! - [`presence`]: ephemeral cursors, typing and dragging state
//! - [`signals`]: per-project pub/sub for access signals
//! - [`access`]: connection authorization and revocation
//! - [`storage`]: update log, versions and graph rows
//! - [`persistence`]: retrying append path and document replay
//! - [`registry`]: live documents and their grace-period unload
//! - [`versions`]: temporal versioning (save, reconstruct, restore)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue

pub mod access;
pub mod broadcast;
pub mod client;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod signals;
pub mod storage;
pub mod versions;

pub use access::{
    AccessDirectory, AccessError, AccessGate, AuthenticatedUser, ConnectionCredentials,
    DocumentName, MemoryDirectory,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientError, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use persistence::{PersistenceConfig, PersistenceGateway, PersistenceStats};
pub use presence::{AwarenessMessage, CursorColor, PresenceRecord, PresenceRoom, PresenceUpdate};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, CLOSE_ACCESS_REVOKED};
pub use registry::{DocumentRegistry, LiveDocument, RegistryConfig, RegistryError, RegistryStats};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use signals::{Signal, SignalHub};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, StoreConfig, StoreError, Storage, StoredLog,
};
pub use versions::{
    SaveOutcome, TemporalState, VersionError, VersionService, VersionSummary,
    MAX_RECONSTRUCT_DEPTH,
};
