//! Client-side directory of browser surfaces and the names they serve.

use crate::transport::BrowserHandle;
use crate::util::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Browser identity -> live handle, and name -> owning browser identity.
#[derive(Default)]
pub struct BrowserDirectory {
    browsers: Mutex<HashMap<String, Arc<dyn BrowserHandle>>>,
    owners: Mutex<HashMap<String, String>>,
}

impl BrowserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly observed browser under a fresh identity.
    ///
    /// Every existing record whose handle is dead, or is this same handle
    /// under an older identity, is purged first.
    pub fn admit(&self, id: &str, handle: Arc<dyn BrowserHandle>) {
        let mut browsers = lock(&self.browsers);
        browsers.retain(|existing_id, existing| {
            let keep = existing.is_valid() && !Arc::ptr_eq(existing, &handle);
            if !keep {
                debug!("Purging browser record {}", existing_id);
            }
            keep
        });
        browsers.insert(id.to_string(), handle);
    }

    /// The handle for `id`, if it is still live.
    pub fn live(&self, id: &str) -> Option<Arc<dyn BrowserHandle>> {
        lock(&self.browsers)
            .get(id)
            .filter(|handle| handle.is_valid())
            .cloned()
    }

    /// Identity currently recorded for `handle`.
    pub fn id_of(&self, handle: &Arc<dyn BrowserHandle>) -> Option<String> {
        lock(&self.browsers)
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, handle))
            .map(|(id, _)| id.clone())
    }

    pub fn browser_count(&self) -> usize {
        lock(&self.browsers).len()
    }

    /// A browser announced that it serves `name`. Last writer wins.
    pub fn claim(&self, name: &str, browser_id: &str) {
        let previous = lock(&self.owners).insert(name.to_string(), browser_id.to_string());
        match previous {
            Some(prev) if prev != browser_id => {
                debug!("Browser {} took over {} from {}", browser_id, name, prev)
            }
            _ => debug!("Browser {} serves {}", browser_id, name),
        }
    }

    /// A browser disowned `name`. Only removes the mapping when that browser
    /// is still the recorded owner.
    pub fn release(&self, name: &str, browser_id: &str) -> bool {
        let mut owners = lock(&self.owners);
        if owners.get(name).map(String::as_str) == Some(browser_id) {
            owners.remove(name);
            true
        } else {
            false
        }
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        lock(&self.owners).get(name).cloned()
    }

    /// Live handle of the browser serving `name`.
    pub fn owner_handle(&self, name: &str) -> Option<Arc<dyn BrowserHandle>> {
        let owner = self.owner(name)?;
        self.live(&owner)
    }
}
