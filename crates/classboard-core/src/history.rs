//! Linear undo/redo history of full board snapshots.
//!
//! The stack is strictly local to one board instance and knows nothing about
//! the network; the coordinator decides whether an undo or redo is announced
//! to peers.

use kurbo::Rect;
use serde::{Deserialize, Serialize};

use crate::board::{BoardState, ImageObject, LineObject, SelectionState, validate_selection};

/// Kind of edit recorded in [`ActivityMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Draw,
    Erase,
    Paste,
    ImageUpdate,
    Delete,
}

/// Where and when a notable edit happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetadata {
    pub kind: ActivityKind,
    pub bounds: Option<Rect>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ActivityMetadata {
    pub fn new(kind: ActivityKind, bounds: Option<Rect>) -> Self {
        Self {
            kind,
            bounds,
            timestamp: crate::operation::now_millis(),
        }
    }
}

/// A full-state checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub lines: Vec<LineObject>,
    pub images: Vec<ImageObject>,
    pub selection: SelectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<ActivityMetadata>,
}

impl HistorySnapshot {
    /// Capture the current content of a board.
    pub fn capture(state: &BoardState) -> Self {
        Self {
            lines: state.lines.clone(),
            images: state.images.clone(),
            selection: state.selection.clone(),
            last_activity: None,
        }
    }

    /// Rebuild board state from this snapshot, re-validating the selection
    /// against the restored objects.
    pub fn restore(&self) -> BoardState {
        let mut state = BoardState {
            lines: self.lines.clone(),
            images: self.images.clone(),
            selection: SelectionState::default(),
        };
        state.selection = validate_selection(&self.selection, &state);
        state
    }
}

/// Snapshot log with a cursor.
///
/// `cursor` always points at the snapshot matching the current board state.
/// Pushing while not at the tip discards the redo branch.
#[derive(Debug, Clone, Default)]
pub struct HistoryStack {
    snapshots: Vec<HistorySnapshot>,
    cursor: usize,
    /// Maximum number of snapshots kept; oldest are dropped first.
    capacity: Option<usize>,
}

impl HistoryStack {
    /// Create an empty, unbounded stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty stack keeping at most `capacity` snapshots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            snapshots: Vec::new(),
            cursor: 0,
            capacity: Some(capacity.max(1)),
        }
    }

    /// Record a snapshot and move the cursor to it.
    pub fn push(&mut self, mut snapshot: HistorySnapshot, activity: Option<ActivityMetadata>) {
        if !self.snapshots.is_empty() && self.cursor < self.snapshots.len() - 1 {
            let dropped = self.snapshots.len() - 1 - self.cursor;
            self.snapshots.truncate(self.cursor + 1);
            log::debug!("History: discarded {} redo snapshot(s)", dropped);
        }

        snapshot.last_activity = activity;
        self.snapshots.push(snapshot);

        if let Some(capacity) = self.capacity {
            if self.snapshots.len() > capacity {
                let excess = self.snapshots.len() - capacity;
                self.snapshots.drain(..excess);
            }
        }

        self.cursor = self.snapshots.len() - 1;
    }

    /// Step back one snapshot. Returns the snapshot now current, or `None`
    /// if already at the oldest one.
    pub fn undo(&mut self) -> Option<&HistorySnapshot> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        log::debug!("History: undo {} -> {}", self.cursor + 1, self.cursor);
        self.snapshots.get(self.cursor)
    }

    /// Step forward one snapshot. Returns the snapshot now current, or `None`
    /// if already at the tip.
    pub fn redo(&mut self) -> Option<&HistorySnapshot> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        log::debug!("History: redo {} -> {}", self.cursor - 1, self.cursor);
        self.snapshots.get(self.cursor)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.snapshots.len()
    }

    /// Most recent activity at or before the cursor.
    ///
    /// Activity is sparse and the stack can be truncated, so this scans
    /// rather than caching a pointer.
    pub fn last_activity(&self) -> Option<&ActivityMetadata> {
        if self.snapshots.is_empty() {
            return None;
        }
        self.snapshots[..=self.cursor]
            .iter()
            .rev()
            .find_map(|s| s.last_activity.as_ref())
    }

    /// Snapshot at the cursor.
    pub fn current(&self) -> Option<&HistorySnapshot> {
        self.snapshots.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[HistorySnapshot] {
        &self.snapshots
    }
}
