//! Classboard Core Library
//!
//! Real-time board synchronization and undo history for teacher/student
//! classroom whiteboards.

pub mod board;
pub mod coordinator;
pub mod direction;
pub mod drawing;
pub mod history;
pub mod images;
pub mod operation;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod session;
pub mod settings;
pub mod transport;

pub use board::{
    BoardState, ImageObject, ImagePatch, LineObject, LineTool, ObjectKind, SelectedObject, SelectionState,
    SerializableColor,
};
pub use coordinator::OperationsCoordinator;
pub use direction::{BoardRole, DirectionControl, SyncConfig, SyncDirection, resolve_sync_config};
pub use history::{ActivityKind, ActivityMetadata, HistorySnapshot, HistoryStack};
pub use operation::{Operation, OperationKind};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use registry::{ChannelRegistry, HandlerId, Registration};
pub use remote::{BoardMutations, RemoteGuard, RemoteOperationApplier};
pub use session::{SyncSession, SyncState};
pub use settings::{DEFAULT_MAX_HISTORY, DEFAULT_STATUS_POLL_INTERVAL_SECS, SyncSettings};
pub use transport::{ConnectionStatus, MemoryHub, MemoryTransport, Transport, TransportError};

#[cfg(not(target_arch = "wasm32"))]
pub use transport::RelayTransport;
