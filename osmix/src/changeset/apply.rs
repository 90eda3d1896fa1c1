use crate::changeset::{ChangeType, Changeset};
use crate::model::EntityType;
use crate::osm::Osm;
use crate::progress::{Progress, Severity};
use crate::store::StoreError;
use error_stack::Report;

/// Materializes a changeset into a fresh index: base entities are copied
/// unless a delete or modify entry shadows them, then create and modify
/// entities are appended, and all indexes are rebuilt. Re-running the same
/// changeset against the same base always yields the same result.
pub fn apply_changeset(base: &Osm, changeset: &Changeset) -> Result<Osm, Report<StoreError>> {
    apply_changeset_with_progress(base, changeset, &Progress::new())
}

/// [`apply_changeset`] with progress events and an abort check between
/// stages. On abort the partial result is dropped.
pub fn apply_changeset_with_progress(
    base: &Osm,
    changeset: &Changeset,
    progress: &Progress,
) -> Result<Osm, Report<StoreError>> {
    base.ensure_ready()?;

    let mut out = Osm::new();
    out.header = base.header.clone();

    for i in base.nodes.sorted() {
        let i = i as usize;
        if changeset.contains(&(EntityType::Node, base.nodes.id(i))) {
            continue;
        }
        out.add_node(&base.nodes.get_by_index(i, &base.strings));
    }
    abort_point(progress, "copied base nodes")?;
    for i in base.ways.sorted() {
        let i = i as usize;
        if changeset.contains(&(EntityType::Way, base.ways.id(i))) {
            continue;
        }
        out.add_way(&base.ways.get_by_index(i, &base.strings));
    }
    for i in base.relations.sorted() {
        let i = i as usize;
        if changeset.contains(&(EntityType::Relation, base.relations.id(i))) {
            continue;
        }
        out.add_relation(&base.relations.get_by_index(i, &base.strings));
    }
    abort_point(progress, "copied base entities")?;

    for change in changeset.iter() {
        match change.change_type {
            ChangeType::Create | ChangeType::Modify => out.add_entity(&change.entity),
            ChangeType::Delete => {}
        }
    }
    abort_point(progress, "applied changes")?;

    out.build_indexes()?;
    out.build_spatial_indexes()?;
    progress.emit(Severity::Ready, "changeset applied");
    Ok(out)
}

fn abort_point(progress: &Progress, stage: &str) -> Result<(), Report<StoreError>> {
    if progress.is_cancelled() {
        return Err(Report::new(StoreError::Aborted));
    }
    progress.emit(Severity::Debug, stage);
    Ok(())
}
