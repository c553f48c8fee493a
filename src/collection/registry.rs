use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use crate::collection::collectors::{CollectorFactory, CollectorHandle};
use crate::collection::{normalize_name, Source};
use crate::error::{Error, Result};

struct RegistryEntry {
    source: Source,
    factory: CollectorFactory,
    cached: Mutex<Option<CollectorHandle>>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Arc<RegistryEntry>>,
    // alias -> canonical name
    aliases: HashMap<String, String>,
}

impl RegistryInner {
    fn canonical(&self, name_or_alias: &str) -> Option<&str> {
        let key = normalize_name(name_or_alias);
        if let Some((name, _)) = self.entries.get_key_value(&key) {
            return Some(name.as_str());
        }
        self.aliases.get(&key).map(|s| s.as_str())
    }

    fn entry(&self, name_or_alias: &str) -> Result<Arc<RegistryEntry>> {
        self.canonical(name_or_alias)
            .and_then(|name| self.entries.get(name))
            .cloned()
            .ok_or_else(|| Error::UnknownSource(name_or_alias.to_string()))
    }
}

fn same_factory(a: &CollectorFactory, b: &CollectorFactory) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Resolves source names and aliases to cached collector instances.
///
/// Created once at startup and handed to the orchestrator. A collector is built by its
/// factory on the first `resolve` and reused until `invalidate`.
#[derive(Default)]
pub struct CollectorRegistry {
    inner: RwLock<RegistryInner>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        CollectorRegistry::default()
    }

    pub fn register(&self, source: Source, factory: CollectorFactory) -> Result<()> {
        let name = normalize_name(&source.name);
        if name.is_empty() {
            return Err(Error::ConfigValidation("source name cannot be empty".to_string()));
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        // Every name must be free or already point at this very registration
        for key in std::iter::once(&name).chain(source.aliases.iter()) {
            if let Some(existing) = inner.canonical(key) {
                let entry = &inner.entries[existing];
                if existing != name || !same_factory(&entry.factory, &factory) {
                    return Err(Error::DuplicateSource(key.clone()));
                }
            }
        }

        for alias in &source.aliases {
            if *alias != name {
                inner.aliases.insert(alias.clone(), name.clone());
            }
        }

        let mut source = source;
        source.name = name.clone();
        match inner.entries.get(&name) {
            Some(existing) => {
                // Re-registration with the same factory: keep the cache, merge aliases
                let mut merged = existing.source.clone();
                for alias in source.aliases {
                    if !merged.aliases.contains(&alias) {
                        merged.aliases.push(alias);
                    }
                }
                let cached = existing.cached.lock().unwrap_or_else(PoisonError::into_inner).clone();
                inner.entries.insert(name.clone(), Arc::new(RegistryEntry {
                    source: merged,
                    factory,
                    cached: Mutex::new(cached),
                }));
            }
            None => {
                inner.entries.insert(name.clone(), Arc::new(RegistryEntry {
                    source,
                    factory,
                    cached: Mutex::new(None),
                }));
                tracing::info!(source = %name, "Registered collector");
            }
        }
        Ok(())
    }

    /// The cached collector for a source, built on first use.
    pub fn resolve(&self, name_or_alias: &str) -> Result<CollectorHandle> {
        let entry = self.inner.read().unwrap_or_else(PoisonError::into_inner).entry(name_or_alias)?;

        let mut cached = entry.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = cached.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = (entry.factory)().map_err(|e| Error::CollectorConstruction {
            source_name: entry.source.name.clone(),
            reason: e.to_string(),
        })?;
        tracing::debug!(source = %entry.source.name, "Constructed collector");
        *cached = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the cached collector; the next `resolve` rebuilds it.
    pub fn invalidate(&self, name_or_alias: &str) -> Result<()> {
        let entry = self.inner.read().unwrap_or_else(PoisonError::into_inner).entry(name_or_alias)?;
        *entry.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::info!(source = %entry.source.name, "Invalidated cached collector");
        Ok(())
    }

    pub fn canonical_name(&self, name_or_alias: &str) -> Result<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .canonical(name_or_alias)
            .map(str::to_string)
            .ok_or_else(|| Error::UnknownSource(name_or_alias.to_string()))
    }

    pub fn source(&self, name_or_alias: &str) -> Result<Source> {
        let entry = self.inner.read().unwrap_or_else(PoisonError::into_inner).entry(name_or_alias)?;
        Ok(entry.source.clone())
    }

    /// Canonical sources only, aliases collapsed. Sorted by name.
    pub fn list_sources(&self) -> Vec<Source> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut sources: Vec<Source> = inner.entries.values().map(|e| e.source.clone()).collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
