//! Store helpers shared by the reconcilers

use crate::error::ReconcileResult;
use tracing::debug;
use volplane_common::{FINALIZER, Resource};
use volplane_meta_store::Store;

/// Fetch an object, mapping `NotFound` to `None`
pub(crate) fn get_optional<R: Resource>(store: &Store<R>, id: &str) -> ReconcileResult<Option<R>> {
    match store.get(id) {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Attach the controller finalizer and persist
pub(crate) fn add_finalizer<R: Resource>(store: &Store<R>, mut object: R) -> ReconcileResult<()> {
    if object.metadata_mut().add_finalizer(FINALIZER) {
        debug!(collection = R::COLLECTION, id = %object.id(), "adding finalizer");
        store.update(object)?;
    }
    Ok(())
}

/// Drop the controller finalizer. Once no finalizers remain the store
/// removes the object.
pub(crate) fn strip_finalizer<R: Resource>(store: &Store<R>, mut object: R) -> ReconcileResult<()> {
    if object.metadata_mut().remove_finalizer(FINALIZER) {
        debug!(collection = R::COLLECTION, id = %object.id(), "removing finalizer");
        store.update(object)?;
    }
    Ok(())
}

/// Request deletion, treating an already removed object as deleted
pub(crate) fn delete_ignore_missing<R: Resource>(store: &Store<R>, id: &str) -> ReconcileResult<()> {
    match store.delete(id) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
