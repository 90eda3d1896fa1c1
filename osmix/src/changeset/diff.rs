use crate::changeset::{Change, ChangeType, Changeset};
use crate::model::entities_equal;
use crate::osm::Osm;
use crate::store::StoreError;
use error_stack::Report;

/// Compares every patch entity against the base by id: absent becomes a
/// create, present-but-different becomes a modify carrying the patch
/// version. Patches are additive; deletions are never inferred here.
pub fn generate_direct_changes(base: &Osm, patch: &Osm) -> Result<Changeset, Report<StoreError>> {
    base.ensure_ready()?;
    patch.ensure_ready()?;

    let mut changeset = Changeset::new();
    for entity in patch.sorted_entities() {
        match base.get_entity(entity.entity_type(), entity.id()) {
            None => changeset.insert(Change {
                change_type: ChangeType::Create,
                entity,
                refs: Vec::new(),
            }),
            Some(existing) => {
                if !entities_equal(&existing, &entity) {
                    changeset.insert(Change {
                        change_type: ChangeType::Modify,
                        entity,
                        refs: Vec::new(),
                    });
                }
            }
        }
    }
    Ok(changeset)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{EntityType, Node};

    fn node(id: i64, tags: Vec<(&str, &str)>) -> Node {
        Node {
            id,
            lon: 1.0,
            lat: 2.0,
            tags: tags
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        }
    }

    #[test]
    fn test_create_and_modify() {
        let mut base = Osm::new();
        base.add_node(&node(5, vec![("amenity", "cafe")]));
        base.build_indexes().unwrap();

        let mut patch = Osm::new();
        patch.add_node(&node(5, vec![("amenity", "cafe"), ("name", "X")]));
        patch.add_node(&node(6, vec![]));
        patch.build_indexes().unwrap();

        let changeset = generate_direct_changes(&base, &patch).unwrap();
        assert_eq!(changeset.stats.total_changes, 2);
        assert_eq!(changeset.stats.modifies, 1);
        assert_eq!(changeset.stats.creates, 1);
        assert_eq!(
            changeset.get(&(EntityType::Node, 5)).unwrap().change_type,
            ChangeType::Modify
        );
        assert_eq!(
            changeset.get(&(EntityType::Node, 6)).unwrap().change_type,
            ChangeType::Create
        );
    }

    #[test]
    fn test_tag_order_does_not_modify() {
        let mut base = Osm::new();
        base.add_node(&node(1, vec![("a", "1"), ("b", "2")]));
        base.build_indexes().unwrap();

        let mut patch = Osm::new();
        patch.add_node(&node(1, vec![("b", "2"), ("a", "1")]));
        patch.build_indexes().unwrap();

        let changeset = generate_direct_changes(&base, &patch).unwrap();
        assert!(changeset.is_empty());
    }
}
