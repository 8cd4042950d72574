//! Resource-links aggregate model
//!
//! The set of links a device has published, keyed by href (unique per
//! device).

use std::collections::HashMap;

use crate::events::{EventEnvelope, EventPayload, ResourceLink};

#[derive(Debug, Clone, Default)]
pub struct ResourceLinksModel {
    device_id: Option<String>,
    resources: HashMap<String, ResourceLink>,
}

impl ResourceLinksModel {
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn resources(&self) -> &HashMap<String, ResourceLink> {
        &self.resources
    }

    pub fn link(&self, href: &str) -> Option<&ResourceLink> {
        self.resources.get(href)
    }

    /// Links whose resource types intersect `type_filter`; an empty filter
    /// matches everything.
    pub fn links_by_type(&self, type_filter: &[String]) -> Vec<ResourceLink> {
        self.resources
            .values()
            .filter(|link| {
                type_filter.is_empty()
                    || link
                        .resource_types
                        .iter()
                        .any(|t| type_filter.contains(t))
            })
            .cloned()
            .collect()
    }

    pub(crate) fn apply(&mut self, event: &EventEnvelope) -> bool {
        match &event.payload {
            EventPayload::ResourceLinksPublished { links } => {
                for link in links {
                    self.resources.insert(link.href.clone(), link.clone());
                }
            }
            EventPayload::ResourceLinksUnpublished { hrefs } => {
                // an empty href list unpublishes everything
                if hrefs.is_empty() {
                    self.resources.clear();
                } else {
                    for href in hrefs {
                        self.resources.remove(href);
                    }
                }
            }
            EventPayload::ResourceLinksSnapshotTaken { links } => {
                self.resources = links
                    .iter()
                    .map(|link| (link.href.clone(), link.clone()))
                    .collect();
            }
            _ => return false,
        }
        self.device_id = Some(event.resource_id.device_id.clone());
        true
    }
}
