//! Image paste, transform and lock handling.

use crate::board::{ImageObject, ImagePatch};
use crate::coordinator::BoardContext;
use crate::history::{ActivityKind, ActivityMetadata};
use crate::operation::OperationKind;
use crate::remote::RemoteGuard;

#[derive(Debug, Clone)]
pub struct ImageOperations {
    guard: RemoteGuard,
}

impl ImageOperations {
    pub fn new(guard: RemoteGuard) -> Self {
        Self { guard }
    }

    pub(crate) fn paste(&self, ctx: &mut BoardContext<'_>, image: ImageObject) -> bool {
        if ctx.state.image(&image.id).is_some() {
            log::debug!("Image {} already exists", image.id);
            return false;
        }

        let activity = ActivityMetadata::new(ActivityKind::Paste, Some(image.bounds()));
        ctx.state.images.push(image.clone());
        ctx.commit(Some(activity));
        self.broadcast(ctx, OperationKind::ImagePaste { image });
        true
    }

    /// Move or resize an image. Locked images are left alone.
    pub(crate) fn update(&self, ctx: &mut BoardContext<'_>, image_id: &str, patch: &ImagePatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        let Some(image) = ctx.state.image_mut(image_id) else {
            log::debug!("Cannot update unknown image {}", image_id);
            return false;
        };
        if image.locked {
            log::debug!("Image {} is locked", image_id);
            return false;
        }

        let before = image.bounds();
        image.apply_patch(patch);
        let bounds = before.union(image.bounds());

        ctx.commit(Some(ActivityMetadata::new(ActivityKind::ImageUpdate, Some(bounds))));
        self.broadcast(
            ctx,
            OperationKind::ImageUpdate {
                image_id: image_id.to_string(),
                patch: patch.clone(),
            },
        );
        true
    }

    /// Flip an image's lock. Returns the new lock state.
    pub(crate) fn toggle_lock(&self, ctx: &mut BoardContext<'_>, image_id: &str) -> Option<bool> {
        let Some(image) = ctx.state.image_mut(image_id) else {
            log::debug!("Cannot toggle lock on unknown image {}", image_id);
            return None;
        };
        image.locked = !image.locked;
        let locked = image.locked;

        ctx.commit(None);
        self.broadcast(ctx, OperationKind::ImageToggleLock { image_id: image_id.to_string() });
        Some(locked)
    }

    fn broadcast(&self, ctx: &mut BoardContext<'_>, kind: OperationKind) {
        if self.guard.is_applying() {
            return;
        }
        ctx.send(kind);
    }
}
