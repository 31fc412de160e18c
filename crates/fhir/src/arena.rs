//! Resolution arena for the resources of one bundle.
//!
//! Resources are stored by entry index and looked up by `fullUrl` or `Type/id`. Reference
//! resolution is a flat lookup per reference, so cyclic graphs (A references B, B
//! references A) resolve without any traversal of the graph itself.

use serde_json::Value;
use std::collections::HashMap;

/// A bundle entry's resource as seen by the arena.
#[derive(Clone, Debug)]
pub struct ArenaResource<'a> {
    /// Position of the entry in `Bundle.entry`.
    pub index: usize,
    pub full_url: Option<&'a str>,
    pub resource_type: &'a str,
    pub id: Option<&'a str>,
    pub value: &'a Value,
}

/// Outcome of resolving one reference string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Another entry of the bundle, by index.
    Entry(usize),
    /// A resource contained by (or equal to) the referring entry.
    Contained(usize),
    /// Nothing in the bundle matches.
    Unresolved,
}

/// Key that collided when inserting into the arena.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateKey {
    pub key: String,
    pub first_index: usize,
}

/// Index of bundle resources keyed by `fullUrl` and `Type/id`.
#[derive(Debug, Default)]
pub struct ResourceArena<'a> {
    resources: Vec<ArenaResource<'a>>,
    by_full_url: HashMap<&'a str, usize>,
    by_type_id: HashMap<(&'a str, &'a str), usize>,
}

impl<'a> ResourceArena<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource. Keys already claimed by an earlier entry are reported and the
    /// resource is not indexed under them.
    pub fn insert(&mut self, resource: ArenaResource<'a>) -> Vec<DuplicateKey> {
        let index = resource.index;
        let mut duplicates = Vec::new();

        if let Some(full_url) = resource.full_url {
            match self.by_full_url.get(full_url) {
                Some(&first_index) => duplicates.push(DuplicateKey {
                    key: full_url.to_owned(),
                    first_index,
                }),
                None => {
                    self.by_full_url.insert(full_url, index);
                }
            }
        }
        if let Some(id) = resource.id {
            let key = (resource.resource_type, id);
            match self.by_type_id.get(&key) {
                Some(&first_index) => duplicates.push(DuplicateKey {
                    key: format!("{}/{}", resource.resource_type, id),
                    first_index,
                }),
                None => {
                    self.by_type_id.insert(key, index);
                }
            }
        }

        self.resources.push(resource);
        duplicates
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ArenaResource<'a>> {
        self.resources.iter().find(|r| r.index == index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArenaResource<'a>> {
        self.resources.iter()
    }

    /// Resolves `reference` as written inside the entry at `container`.
    pub fn resolve(&self, reference: &str, container: usize) -> Resolution {
        if let Some(local) = reference.strip_prefix('#') {
            return self.resolve_contained(local, container);
        }
        if let Some(&index) = self.by_full_url.get(reference) {
            return Resolution::Entry(index);
        }
        if reference.starts_with("urn:") {
            return Resolution::Unresolved;
        }

        // Relative references resolve against the referring entry's base first.
        if !reference.contains("://") {
            if let Some(base) = self.get(container).and_then(|r| r.full_url).and_then(server_base)
            {
                let absolute = format!("{base}/{reference}");
                if let Some(&index) = self.by_full_url.get(absolute.as_str()) {
                    return Resolution::Entry(index);
                }
            }
        }

        match split_type_id(reference) {
            Some(key) => self
                .by_type_id
                .get(&key)
                .map_or(Resolution::Unresolved, |&index| Resolution::Entry(index)),
            None => Resolution::Unresolved,
        }
    }

    fn resolve_contained(&self, local: &str, container: usize) -> Resolution {
        let Some(resource) = self.get(container) else {
            return Resolution::Unresolved;
        };
        if local.is_empty() {
            return Resolution::Contained(container);
        }
        let found = resource
            .value
            .get("contained")
            .and_then(Value::as_array)
            .is_some_and(|items| {
                items
                    .iter()
                    .any(|c| c.get("id").and_then(Value::as_str) == Some(local))
            });
        if found {
            Resolution::Contained(container)
        } else {
            Resolution::Unresolved
        }
    }
}

/// `http://host/fhir/Patient/1` -> `http://host/fhir`
fn server_base(full_url: &str) -> Option<&str> {
    if !full_url.contains("://") {
        return None;
    }
    let mut parts = full_url.rsplitn(3, '/');
    let _id = parts.next()?;
    let _resource_type = parts.next()?;
    parts.next()
}

/// Extracts `(Type, id)` from `Type/id`, `Type/id/_history/v` or an absolute URL ending in
/// either form.
fn split_type_id(reference: &str) -> Option<(&str, &str)> {
    let segments: Vec<&str> = reference.split('/').filter(|s| !s.is_empty()).collect();
    let tail = match segments.as_slice() {
        [.., t, id, "_history", _version] => (*t, *id),
        [.., t, id] => (*t, *id),
        _ => return None,
    };
    let starts_upper = tail.0.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    (starts_upper && !tail.1.is_empty()).then_some(tail)
}
