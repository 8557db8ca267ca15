//! Enrolled identities and the read-only gallery they form.

use crate::types::Descriptor;
use serde::Serialize;

/// A labelled person with at least one reference descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    label: String,
    descriptors: Vec<Descriptor>,
}

impl Identity {
    /// Returns `None` when `descriptors` is empty; such identities cannot be matched.
    pub fn new(label: impl Into<String>, descriptors: Vec<Descriptor>) -> Option<Self> {
        if descriptors.is_empty() {
            return None;
        }
        Some(Self {
            label: label.into(),
            descriptors,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
}

/// Per-label summary, used for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GalleryEntry {
    pub label: String,
    pub descriptors: usize,
}

/// Ordered label → descriptors mapping. Iteration order is insertion order.
///
/// A gallery has no mutating API once built; share it as `Arc<Gallery>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    /// Build a gallery from identities, keeping the first of any repeated label.
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let mut kept: Vec<Identity> = Vec::new();
        for identity in identities {
            if kept.iter().any(|i| i.label == identity.label) {
                tracing::warn!(label = %identity.label, "duplicate identity label ignored");
                continue;
            }
            kept.push(identity);
        }
        Self { identities: kept }
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn get(&self, label: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.label == label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.get(label).is_some()
    }

    /// Label → descriptor count, in gallery order.
    pub fn summary(&self) -> Vec<GalleryEntry> {
        self.identities
            .iter()
            .map(|i| GalleryEntry {
                label: i.label.clone(),
                descriptors: i.descriptors.len(),
            })
            .collect()
    }
}
