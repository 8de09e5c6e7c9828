//! Topological ordering of a batch of collections for non-atomic backends
//! (§4.6): segments first, then flags ordered so every prerequisite
//! precedes its dependent, then any other kinds.

use std::collections::{HashMap, HashSet};

use crate::model::{Collection, FlagKind, ItemDescriptor, Kind};

/// Reorders `collections` per §4.6: segments precede flags; within flags, a
/// depth-first post-order traversal over the prerequisite edges emits each
/// flag after every prerequisite that is present in the same batch (a
/// missing prerequisite is silently skipped — it may be excluded from this
/// batch, or not yet known). Other kinds are appended after flags in their
/// given relative order.
///
/// A prerequisite cycle would make a naive post-order traversal recurse
/// forever; `spec.md` assumes acyclic input (cycles are an upstream
/// authoring bug), but this implementation still guards against it by
/// marking a node visited before descending into its dependencies, so a
/// cyclic batch terminates (in some order) rather than overflowing the
/// stack.
pub fn order_collections(collections: Vec<Collection>) -> Vec<Collection> {
    let mut segments: Option<Collection> = None;
    let mut flags: Option<Collection> = None;
    let mut others: Vec<Collection> = Vec::new();

    for collection in collections {
        match collection.0 {
            Kind::SEGMENTS => segments = Some(collection),
            Kind::FLAGS => flags = Some(collection),
            _ => others.push(collection),
        }
    }

    let mut result = Vec::new();
    if let Some(seg) = segments {
        result.push(seg);
    }
    if let Some((kind, items)) = flags {
        result.push((kind, order_flags(items)));
    }
    result.extend(others);
    result
}

fn order_flags(items: Vec<(String, ItemDescriptor)>) -> Vec<(String, ItemDescriptor)> {
    let flag_kind = FlagKind;
    let by_key: HashMap<String, ItemDescriptor> = items.into_iter().collect();
    let mut keys: Vec<&String> = by_key.keys().collect();
    keys.sort();

    let mut visited: HashSet<String> = HashSet::new();
    let mut output: Vec<(String, ItemDescriptor)> = Vec::with_capacity(by_key.len());
    for key in keys {
        visit(key, &by_key, &mut visited, &mut output, &flag_kind);
    }
    output
}

fn visit(
    key: &str,
    by_key: &HashMap<String, ItemDescriptor>,
    visited: &mut HashSet<String>,
    output: &mut Vec<(String, ItemDescriptor)>,
    flag_kind: &FlagKind,
) {
    if !visited.insert(key.to_owned()) {
        return;
    }
    let Some(item) = by_key.get(key) else {
        return;
    };
    let mut deps = crate::model::DataKind::dependency_keys(flag_kind, item);
    deps.sort();
    for dep in deps {
        if by_key.contains_key(&dep) {
            visit(&dep, by_key, visited, output, flag_kind);
        }
    }
    output.push((key.to_owned(), item.clone()));
}
