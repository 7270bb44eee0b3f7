//! Applying operations received from peers.
//!
//! A remote operation is replayed through the same mutation paths a local edit
//! takes. While it is being replayed the board's [`RemoteGuard`] is raised, and
//! every outbound send path checks the guard so the replay is not broadcast
//! back to the topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kurbo::Point;

use crate::board::{ImageObject, ImagePatch, LineObject};
use crate::operation::{Operation, OperationKind};

/// Per-board flag raised while a remote operation is applied.
///
/// Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct RemoteGuard(Arc<AtomicBool>);

impl RemoteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applying(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the guard until the returned scope is dropped.
    pub fn enter(&self) -> GuardScope<'_> {
        let previous = self.0.swap(true, Ordering::AcqRel);
        GuardScope { guard: self, previous }
    }
}

/// Restores the guard to its previous value on drop, including on unwind.
#[must_use = "the guard is lowered as soon as the scope is dropped"]
pub struct GuardScope<'a> {
    guard: &'a RemoteGuard,
    previous: bool,
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        self.guard.0.store(self.previous, Ordering::Release);
    }
}

/// Board mutations a remote operation can trigger.
///
/// Each returns whether the board changed; `false` means the operation
/// referenced something this board does not have.
pub trait BoardMutations {
    fn apply_draw_start(&mut self, line: LineObject) -> bool;
    fn apply_draw_continue(&mut self, line_id: &str, points: &[Point]) -> bool;
    fn apply_draw_stop(&mut self, line_id: &str) -> bool;
    fn apply_image_paste(&mut self, image: ImageObject) -> bool;
    fn apply_image_update(&mut self, image_id: &str, patch: &ImagePatch) -> bool;
    fn apply_image_toggle_lock(&mut self, image_id: &str) -> bool;
    fn apply_delete(&mut self, line_ids: &[String], image_ids: &[String]) -> bool;
    fn undo(&mut self) -> bool;
    fn redo(&mut self) -> bool;
}

/// Replays received operations onto a board.
#[derive(Debug, Clone)]
pub struct RemoteOperationApplier {
    guard: RemoteGuard,
}

impl RemoteOperationApplier {
    pub fn new(guard: RemoteGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &RemoteGuard {
        &self.guard
    }

    /// Apply one operation with the guard raised.
    pub fn apply<B: BoardMutations + ?Sized>(&self, operation: &Operation, board: &mut B) -> bool {
        let _scope = self.guard.enter();
        log::debug!(
            "Applying remote {} from {}",
            operation.kind.name(),
            operation.sender_id
        );

        let applied = match &operation.kind {
            OperationKind::DrawStart { line } => board.apply_draw_start(line.clone()),
            OperationKind::DrawContinue { line_id, points } => board.apply_draw_continue(line_id, points),
            OperationKind::DrawStop { line_id } => board.apply_draw_stop(line_id),
            OperationKind::ImagePaste { image } => board.apply_image_paste(image.clone()),
            OperationKind::ImageUpdate { image_id, patch } => board.apply_image_update(image_id, patch),
            OperationKind::ImageToggleLock { image_id } => board.apply_image_toggle_lock(image_id),
            OperationKind::DeleteObjects { line_ids, image_ids } => board.apply_delete(line_ids, image_ids),
            OperationKind::Undo => board.undo(),
            OperationKind::Redo => board.redo(),
        };

        if !applied {
            if operation.kind.is_history() {
                log::debug!("Remote {} at history boundary ignored", operation.kind.name());
            } else {
                log::debug!(
                    "Remote {} ({}) references missing objects",
                    operation.kind.name(),
                    operation.id
                );
            }
        }
        applied
    }
}
