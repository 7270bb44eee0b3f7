//! Per-board operations coordinator.
//!
//! Owns a board's content, its undo history and (when synchronized) its sync
//! session, and routes edits between them:
//!
//! - local edits mutate the board, record history and are broadcast;
//! - received operations are replayed through the same paths with the remote
//!   guard raised, so they are recorded but never broadcast again.
//!
//! Everything runs on the caller's thread. Call [`OperationsCoordinator::poll`]
//! regularly (e.g. once per frame) to apply received operations.

use std::sync::Arc;

use kurbo::Point;
use web_time::Instant;

use crate::board::{
    BoardState, ImageObject, ImagePatch, LineObject, LineTool, ObjectKind, SelectedObject, SelectionState,
    SerializableColor,
};
use crate::direction::SyncConfig;
use crate::drawing::DrawingOperations;
use crate::history::{ActivityKind, ActivityMetadata, HistorySnapshot, HistoryStack};
use crate::images::ImageOperations;
use crate::operation::{Operation, OperationKind};
use crate::registry::ChannelRegistry;
use crate::remote::{BoardMutations, RemoteGuard, RemoteOperationApplier};
use crate::session::{SyncSession, SyncState};
use crate::settings::SyncSettings;

/// Mutable view of one board handed to the domain handlers.
pub(crate) struct BoardContext<'a> {
    pub(crate) state: &'a mut BoardState,
    history: &'a mut HistoryStack,
    session: Option<&'a mut SyncSession>,
}

impl BoardContext<'_> {
    /// Record the current board content as a new history snapshot.
    pub(crate) fn commit(&mut self, activity: Option<ActivityMetadata>) {
        self.history.push(HistorySnapshot::capture(self.state), activity);
    }

    pub(crate) fn send(&mut self, kind: OperationKind) -> Option<Operation> {
        self.session.as_deref_mut()?.send(kind)
    }
}

pub struct OperationsCoordinator {
    board_id: String,
    state: BoardState,
    history: HistoryStack,
    guard: RemoteGuard,
    applier: RemoteOperationApplier,
    drawing: DrawingOperations,
    images: ImageOperations,
    registry: Option<Arc<ChannelRegistry>>,
    session: Option<SyncSession>,
    settings: SyncSettings,
}

impl OperationsCoordinator {
    /// Create a board. It synchronizes when both a registry and a config are
    /// given.
    pub fn new(
        board_id: impl Into<String>,
        registry: Option<Arc<ChannelRegistry>>,
        config: Option<SyncConfig>,
        settings: SyncSettings,
    ) -> Self {
        let board_id = board_id.into();
        let guard = RemoteGuard::new();
        let applier = RemoteOperationApplier::new(guard.clone());
        let drawing = DrawingOperations::new(guard.clone());
        let images = ImageOperations::new(guard.clone());

        let state = BoardState::new();
        let mut history = match settings.max_history {
            Some(capacity) => HistoryStack::with_capacity(capacity),
            None => HistoryStack::new(),
        };
        history.push(HistorySnapshot::capture(&state), None);

        let mut coordinator = Self {
            board_id,
            state,
            history,
            guard,
            applier,
            drawing,
            images,
            registry,
            session: None,
            settings,
        };
        if let Some(config) = config {
            coordinator.session = coordinator.open_session(config);
        }
        coordinator
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn state(&self) -> &BoardState {
        &self.state
    }

    pub fn history(&self) -> &HistoryStack {
        &self.history
    }

    pub fn sync_state(&self) -> Option<&SyncState> {
        self.session.as_ref().map(SyncSession::state)
    }

    pub fn sync_config(&self) -> Option<&SyncConfig> {
        self.session.as_ref().map(SyncSession::config)
    }

    pub fn is_receive_only(&self) -> bool {
        self.sync_config().is_some_and(|c| c.is_receive_only)
    }

    /// Rebind synchronization. `None` disables it.
    pub fn set_sync_config(&mut self, config: Option<SyncConfig>) {
        let Some(config) = config else {
            if self.session.take().is_some() {
                log::info!("Sync disabled for board {}", self.board_id);
            }
            return;
        };

        if let Some(session) = self.session.as_mut() {
            session.update_config(config);
            return;
        }
        self.session = self.open_session(config);
    }

    fn open_session(&self, config: SyncConfig) -> Option<SyncSession> {
        let Some(registry) = self.registry.as_ref() else {
            log::warn!("Board {} has a sync config but no registry", self.board_id);
            return None;
        };
        Some(SyncSession::new(registry.clone(), config, &self.settings))
    }

    /// Broadcast an operation for this board.
    ///
    /// Returns `None` while a remote operation is being applied, when sync is
    /// disabled, or when the send was refused.
    pub fn send_operation(&mut self, kind: OperationKind) -> Option<Operation> {
        if self.guard.is_applying() {
            log::trace!("Suppressing {} during remote apply", kind.name());
            return None;
        }
        self.session.as_mut()?.send(kind)
    }

    /// Apply operations received since the last call. Returns how many were
    /// received.
    pub fn poll(&mut self, now: Instant) -> usize {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        let mut inbound = Vec::new();
        session.poll(now, |operation| inbound.push(operation));

        let applier = self.applier.clone();
        for operation in &inbound {
            applier.apply(operation, self);
        }
        inbound.len()
    }

    // --- History ---

    /// Record a snapshot; `None` captures the current board.
    pub fn add_to_history(&mut self, snapshot: Option<HistorySnapshot>, activity: Option<ActivityMetadata>) {
        let snapshot = snapshot.unwrap_or_else(|| HistorySnapshot::capture(&self.state));
        self.history.push(snapshot, activity);
    }

    pub fn undo(&mut self) -> bool {
        if !self.is_editable("undo") {
            return false;
        }
        let Some(snapshot) = self.history.undo() else {
            return false;
        };
        self.state = snapshot.restore();
        self.drawing.cancel();
        self.send_operation(OperationKind::Undo);
        true
    }

    pub fn redo(&mut self) -> bool {
        if !self.is_editable("redo") {
            return false;
        }
        let Some(snapshot) = self.history.redo() else {
            return false;
        };
        self.state = snapshot.restore();
        self.drawing.cancel();
        self.send_operation(OperationKind::Redo);
        true
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn last_activity(&self) -> Option<&ActivityMetadata> {
        self.history.last_activity()
    }

    // --- Drawing ---

    /// Begin a stroke. Returns its id.
    pub fn start_drawing(
        &mut self,
        tool: LineTool,
        point: Point,
        color: SerializableColor,
        stroke_width: f64,
    ) -> Option<String> {
        if !self.is_editable("draw") {
            return None;
        }
        let (mut ctx, drawing, _) = self.parts();
        Some(drawing.start(&mut ctx, tool, point, color, stroke_width))
    }

    pub fn continue_drawing(&mut self, point: Point) -> bool {
        let (mut ctx, drawing, _) = self.parts();
        drawing.extend(&mut ctx, point)
    }

    /// Finish the current stroke and commit it to history.
    pub fn stop_drawing(&mut self) -> Option<String> {
        let (mut ctx, drawing, _) = self.parts();
        drawing.stop(&mut ctx)
    }

    pub fn active_line(&self) -> Option<&str> {
        self.drawing.active_line()
    }

    // --- Images ---

    pub fn paste_image(&mut self, image: ImageObject) -> Option<String> {
        if !self.is_editable("paste") {
            return None;
        }
        let id = image.id.clone();
        let (mut ctx, _, images) = self.parts();
        images.paste(&mut ctx, image).then_some(id)
    }

    pub fn update_image(&mut self, image_id: &str, patch: &ImagePatch) -> bool {
        if !self.is_editable("update image") {
            return false;
        }
        let (mut ctx, _, images) = self.parts();
        images.update(&mut ctx, image_id, patch)
    }

    /// Returns the new lock state.
    pub fn toggle_image_lock(&mut self, image_id: &str) -> Option<bool> {
        if !self.is_editable("lock image") {
            return None;
        }
        let (mut ctx, _, images) = self.parts();
        images.toggle_lock(&mut ctx, image_id)
    }

    // --- Selection ---

    /// Replace the selection. References to missing objects are dropped.
    pub fn select(&mut self, objects: Vec<SelectedObject>) {
        let selected_objects = objects.into_iter().filter(|o| self.state.contains(o)).collect();
        self.state.selection = SelectionState {
            selected_objects,
            selection_bounds: None,
            is_selecting: false,
        };
        self.state.selection.selection_bounds = self.state.selected_bounds();
    }

    pub fn clear_selection(&mut self) {
        self.state.selection = SelectionState::default();
    }

    /// Delete every selected object. Returns the number removed.
    pub fn delete_selected(&mut self) -> usize {
        if !self.is_editable("delete") {
            return 0;
        }
        let (line_ids, image_ids): (Vec<_>, Vec<_>) = self
            .state
            .selection
            .selected_objects
            .iter()
            .partition(|o| o.kind == ObjectKind::Line);
        let line_ids: Vec<String> = line_ids.into_iter().map(|o| o.id.clone()).collect();
        let image_ids: Vec<String> = image_ids.into_iter().map(|o| o.id.clone()).collect();
        self.delete_objects(&line_ids, &image_ids)
    }

    fn delete_objects(&mut self, line_ids: &[String], image_ids: &[String]) -> usize {
        let bounds = line_ids
            .iter()
            .filter_map(|id| self.state.line(id).and_then(LineObject::bounds))
            .chain(image_ids.iter().filter_map(|id| self.state.image(id).map(ImageObject::bounds)))
            .reduce(|a, b| a.union(b));

        let removed = self.state.remove_objects(line_ids, image_ids);
        if removed == 0 {
            return 0;
        }

        self.history.push(
            HistorySnapshot::capture(&self.state),
            Some(ActivityMetadata::new(ActivityKind::Delete, bounds)),
        );
        self.send_operation(OperationKind::DeleteObjects {
            line_ids: line_ids.to_vec(),
            image_ids: image_ids.to_vec(),
        });
        removed
    }

    /// Local edits are refused on receive-only boards; remote ones never are.
    fn is_editable(&self, action: &str) -> bool {
        if self.is_receive_only() && !self.guard.is_applying() {
            log::debug!("Board {} is receive-only, ignoring {}", self.board_id, action);
            return false;
        }
        true
    }

    fn parts(&mut self) -> (BoardContext<'_>, &mut DrawingOperations, &ImageOperations) {
        (
            BoardContext {
                state: &mut self.state,
                history: &mut self.history,
                session: self.session.as_mut(),
            },
            &mut self.drawing,
            &self.images,
        )
    }
}

impl BoardMutations for OperationsCoordinator {
    fn apply_draw_start(&mut self, line: LineObject) -> bool {
        let (mut ctx, drawing, _) = self.parts();
        drawing.begin_line(&mut ctx, line)
    }

    fn apply_draw_continue(&mut self, line_id: &str, points: &[Point]) -> bool {
        let (mut ctx, drawing, _) = self.parts();
        drawing.append_points(&mut ctx, line_id, points)
    }

    fn apply_draw_stop(&mut self, line_id: &str) -> bool {
        let (mut ctx, drawing, _) = self.parts();
        drawing.finish_line(&mut ctx, line_id)
    }

    fn apply_image_paste(&mut self, image: ImageObject) -> bool {
        let (mut ctx, _, images) = self.parts();
        images.paste(&mut ctx, image)
    }

    fn apply_image_update(&mut self, image_id: &str, patch: &ImagePatch) -> bool {
        let (mut ctx, _, images) = self.parts();
        images.update(&mut ctx, image_id, patch)
    }

    fn apply_image_toggle_lock(&mut self, image_id: &str) -> bool {
        let (mut ctx, _, images) = self.parts();
        images.toggle_lock(&mut ctx, image_id).is_some()
    }

    fn apply_delete(&mut self, line_ids: &[String], image_ids: &[String]) -> bool {
        self.delete_objects(line_ids, image_ids) > 0
    }

    fn undo(&mut self) -> bool {
        OperationsCoordinator::undo(self)
    }

    fn redo(&mut self) -> bool {
        OperationsCoordinator::redo(self)
    }
}
