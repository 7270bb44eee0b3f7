//! Freehand stroke handling.

use kurbo::Point;

use crate::board::{LineObject, LineTool, SerializableColor};
use crate::coordinator::BoardContext;
use crate::history::{ActivityKind, ActivityMetadata};
use crate::operation::OperationKind;
use crate::remote::RemoteGuard;

/// Tracks the locally drawn stroke and announces stroke edits.
#[derive(Debug, Clone)]
pub struct DrawingOperations {
    guard: RemoteGuard,
    active_line: Option<String>,
}

impl DrawingOperations {
    pub fn new(guard: RemoteGuard) -> Self {
        Self { guard, active_line: None }
    }

    /// Id of the stroke currently being drawn locally.
    pub fn active_line(&self) -> Option<&str> {
        self.active_line.as_deref()
    }

    /// Forget the local stroke without committing it.
    pub(crate) fn cancel(&mut self) {
        self.active_line = None;
    }

    pub(crate) fn start(
        &mut self,
        ctx: &mut BoardContext<'_>,
        tool: LineTool,
        point: Point,
        color: SerializableColor,
        stroke_width: f64,
    ) -> String {
        if self.active_line.is_some() {
            self.stop(ctx);
        }
        let line = LineObject::new(tool, point, color, stroke_width);
        let id = line.id.clone();
        self.begin_line(ctx, line);
        id
    }

    pub(crate) fn extend(&mut self, ctx: &mut BoardContext<'_>, point: Point) -> bool {
        let Some(line_id) = self.active_line.clone() else {
            return false;
        };
        self.append_points(ctx, &line_id, &[point])
    }

    pub(crate) fn stop(&mut self, ctx: &mut BoardContext<'_>) -> Option<String> {
        let line_id = self.active_line.take()?;
        self.finish_line(ctx, &line_id).then_some(line_id)
    }

    /// Insert a stroke. Remote strokes never become the local active line.
    pub(crate) fn begin_line(&mut self, ctx: &mut BoardContext<'_>, line: LineObject) -> bool {
        if ctx.state.line(&line.id).is_some() {
            log::debug!("Stroke {} already exists", line.id);
            return false;
        }

        if !self.guard.is_applying() {
            self.active_line = Some(line.id.clone());
        }
        ctx.state.lines.push(line.clone());
        self.broadcast(ctx, OperationKind::DrawStart { line });
        true
    }

    pub(crate) fn append_points(&mut self, ctx: &mut BoardContext<'_>, line_id: &str, points: &[Point]) -> bool {
        let Some(line) = ctx.state.line_mut(line_id) else {
            log::debug!("Cannot extend unknown stroke {}", line_id);
            return false;
        };
        line.points.extend_from_slice(points);
        self.broadcast(
            ctx,
            OperationKind::DrawContinue {
                line_id: line_id.to_string(),
                points: points.to_vec(),
            },
        );
        true
    }

    /// Commit a finished stroke to history.
    pub(crate) fn finish_line(&mut self, ctx: &mut BoardContext<'_>, line_id: &str) -> bool {
        let Some(line) = ctx.state.line(line_id) else {
            log::debug!("Cannot finish unknown stroke {}", line_id);
            return false;
        };
        let kind = match line.tool {
            LineTool::Eraser => ActivityKind::Erase,
            LineTool::Pen | LineTool::Highlighter => ActivityKind::Draw,
        };
        let activity = ActivityMetadata::new(kind, line.bounds());

        ctx.commit(Some(activity));
        self.broadcast(ctx, OperationKind::DrawStop { line_id: line_id.to_string() });
        true
    }

    fn broadcast(&self, ctx: &mut BoardContext<'_>, kind: OperationKind) {
        if self.guard.is_applying() {
            return;
        }
        ctx.send(kind);
    }
}
