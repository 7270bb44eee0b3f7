//! Sync direction and topic resolution.
//!
//! Several local board ids alias onto one shared topic: the teacher's main
//! board and every student's mirror of it share `session-<id>-main`, and a
//! student's personal board shares `session-<id>-student-<suffix>` with the
//! teacher's view of that student. Who may write to a student topic is decided
//! by the participant's [`SyncDirection`].

use serde::{Deserialize, Serialize};

const TEACHER_MAIN_ID: &str = "teacher-main";
const TEACHER_MIRROR_ID: &str = "student-shared-teacher";
const STUDENT_PERSONAL_PREFIX: &str = "student-personal-view-";
const STUDENT_BOARD_PREFIX: &str = "student-board-";

/// Which party currently owns write access to a student's personal board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    TeacherActive,
    #[default]
    StudentActive,
}

impl SyncDirection {
    /// The direction after a control transfer.
    pub fn toggled(self) -> Self {
        match self {
            SyncDirection::TeacherActive => SyncDirection::StudentActive,
            SyncDirection::StudentActive => SyncDirection::TeacherActive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::TeacherActive => "teacher_active",
            SyncDirection::StudentActive => "student_active",
        }
    }
}

/// Derived synchronization settings for one board instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Shared topic the board publishes to and receives from.
    pub topic: String,
    pub session_id: String,
    /// Identity stamped on every operation this board sends.
    pub sender_id: String,
    pub is_receive_only: bool,
}

/// Role of a local board, recognised from its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardRole {
    /// The teacher's own board.
    TeacherMain,
    /// A student's read-only mirror of the teacher's board.
    TeacherMirror,
    /// A student's own board.
    StudentPersonal { suffix: String },
    /// The teacher's view of a student's board.
    StudentBoard { suffix: String },
    Unknown,
}

impl BoardRole {
    /// Classify a board id. Student suffixes are lower-cased.
    pub fn parse(board_id: &str) -> Self {
        if board_id == TEACHER_MAIN_ID {
            BoardRole::TeacherMain
        } else if board_id == TEACHER_MIRROR_ID {
            BoardRole::TeacherMirror
        } else if let Some(suffix) = board_id.strip_prefix(STUDENT_PERSONAL_PREFIX) {
            BoardRole::StudentPersonal { suffix: suffix.to_lowercase() }
        } else if let Some(suffix) = board_id.strip_prefix(STUDENT_BOARD_PREFIX) {
            BoardRole::StudentBoard { suffix: suffix.to_lowercase() }
        } else {
            BoardRole::Unknown
        }
    }

    /// Shared topic for this role within a session.
    pub fn topic(&self, board_id: &str, session_id: &str) -> String {
        match self {
            BoardRole::TeacherMain | BoardRole::TeacherMirror => format!("session-{}-main", session_id),
            BoardRole::StudentPersonal { suffix } | BoardRole::StudentBoard { suffix } => {
                format!("session-{}-student-{}", session_id, suffix)
            }
            BoardRole::Unknown => board_id.to_string(),
        }
    }

    /// Whether an endpoint in this role is barred from sending edits.
    pub fn is_receive_only(&self, direction: SyncDirection) -> bool {
        match self {
            BoardRole::TeacherMain => false,
            BoardRole::TeacherMirror => true,
            BoardRole::StudentPersonal { .. } => direction == SyncDirection::TeacherActive,
            BoardRole::StudentBoard { .. } => direction != SyncDirection::TeacherActive,
            BoardRole::Unknown => false,
        }
    }
}

/// Compute the sync configuration for a local board.
///
/// Returns `None` when there is no active session. The effective direction is
/// `override_direction`, then `participant_direction`, then
/// [`SyncDirection::StudentActive`]. Unrecognised board ids keep their own id
/// as topic and stay writable.
pub fn resolve_sync_config(
    board_id: &str,
    session_id: Option<&str>,
    sender_id: &str,
    participant_direction: Option<SyncDirection>,
    override_direction: Option<SyncDirection>,
) -> Option<SyncConfig> {
    let Some(session_id) = session_id else {
        log::debug!("No session for board {}, sync disabled", board_id);
        return None;
    };

    let direction = override_direction.or(participant_direction).unwrap_or_default();
    let role = BoardRole::parse(board_id);
    if role == BoardRole::Unknown {
        log::debug!("Unknown board type {}, defaulting to interactive mode", board_id);
    }

    let config = SyncConfig {
        topic: role.topic(board_id, session_id),
        session_id: session_id.to_string(),
        sender_id: sender_id.to_string(),
        is_receive_only: role.is_receive_only(direction),
    };

    log::debug!(
        "Board {} -> topic {} (direction {}, receive-only {})",
        board_id,
        config.topic,
        direction.as_str(),
        config.is_receive_only
    );

    Some(config)
}

/// Control-transfer state for one participant.
///
/// Holds the authoritative direction last confirmed by the roster plus an
/// optimistic override applied while a toggle is in flight.
#[derive(Debug, Clone, Default)]
pub struct DirectionControl {
    authoritative: Option<SyncDirection>,
    pending: Option<SyncDirection>,
}

impl DirectionControl {
    pub fn new(authoritative: Option<SyncDirection>) -> Self {
        Self {
            authoritative,
            pending: None,
        }
    }

    /// The direction boards should resolve against right now.
    pub fn effective(&self) -> SyncDirection {
        self.pending.or(self.authoritative).unwrap_or_default()
    }

    pub fn authoritative(&self) -> Option<SyncDirection> {
        self.authoritative
    }

    /// The optimistic override, for passing to [`resolve_sync_config`].
    pub fn override_direction(&self) -> Option<SyncDirection> {
        self.pending
    }

    /// Check if a toggle is waiting for confirmation.
    pub fn is_updating(&self) -> bool {
        self.pending.is_some()
    }

    /// Optimistically flip the direction. Returns the new effective direction.
    pub fn begin_toggle(&mut self) -> SyncDirection {
        let next = self.effective().toggled();
        self.pending = Some(next);
        next
    }

    /// Record an authoritative value. The override is dropped once the
    /// authoritative value agrees with it.
    pub fn confirm(&mut self, direction: SyncDirection) {
        self.authoritative = Some(direction);
        if self.pending == Some(direction) {
            self.pending = None;
        }
    }

    /// Abandon the in-flight toggle.
    pub fn rollback(&mut self) {
        self.pending = None;
    }
}
