//! A [`SharedCache`] read from a JSON manifest.
//!
//! The manifest describes the classes stored in the shared class cache, keyed
//! by their offsets, and the methods of each class:
//!
//! ```json
//! {
//!   "classes": [
//!     {
//!       "name": "demo/Widget",
//!       "offset": 4096,
//!       "chain_offset": 8192,
//!       "loader_chain_offset": 12288,
//!       "methods": [
//!         { "name": "spin", "signature": "(I)V", "offset": 4160 },
//!         { "name": "size", "signature": "()I", "offset": 4224, "cached": true }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! A request resolves to a method identity as soon as its class offset names a
//! class in the manifest. The class-chain and loader-chain offsets only matter
//! when the executable method is looked up: a mismatch there means the class
//! is not loaded the way the client sees it.

use crate::collab::{CacheAccess, MethodHandle, MethodIdentity, SharedCache};
use anyhow::Context;
use aotserve_core::types::MethodOffsets;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub classes: Vec<ClassEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassEntry {
    pub name: String,
    pub offset: u64,
    pub chain_offset: u64,
    pub loader_chain_offset: u64,
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodEntry {
    pub name: String,
    pub signature: String,
    pub offset: u64,
    /// A compiled artifact for this method is already in the cache.
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub native: bool,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
}

impl MethodEntry {
    fn is_executable(&self) -> bool {
        !self.native && !self.is_abstract
    }
}

/// Lookup tables built from a [`Manifest`].
#[derive(Debug, Default)]
struct CacheIndex {
    classes: Vec<ClassEntry>,
    by_offset: HashMap<u64, usize>,
    lookups: u64,
}

impl CacheIndex {
    fn new(manifest: Manifest) -> anyhow::Result<Self> {
        let mut by_offset = HashMap::with_capacity(manifest.classes.len());
        for (i, class) in manifest.classes.iter().enumerate() {
            if let Some(prev) = by_offset.insert(class.offset, i) {
                anyhow::bail!(
                    "classes {} and {} share offset {:#x}",
                    manifest.classes[prev].name,
                    class.name,
                    class.offset
                );
            }
        }
        Ok(Self {
            classes: manifest.classes,
            by_offset,
            lookups: 0,
        })
    }

    fn class(&self, offset: u64) -> Option<&ClassEntry> {
        self.by_offset.get(&offset).map(|&i| &self.classes[i])
    }

    fn method(&self, offsets: &MethodOffsets) -> Option<(&ClassEntry, usize, &MethodEntry)> {
        let class = self.class(offsets.class)?;
        class
            .methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.offset == offsets.method)
            .map(|(i, m)| (class, i, m))
    }

    /// Like [`CacheIndex::method`], but only through a class whose chains
    /// match the request.
    fn loaded_method(&self, offsets: &MethodOffsets) -> Option<(usize, &MethodEntry)> {
        let (class, i, method) = self.method(offsets)?;
        (class.chain_offset == offsets.class_chain
            && class.loader_chain_offset == offsets.class_chain_loader)
            .then_some((i, method))
    }
}

pub struct ManifestCache {
    index: Mutex<CacheIndex>,
}

impl ManifestCache {
    /// Loads and indexes the manifest at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, is not a valid manifest, or lists
    /// two classes at the same offset.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cache manifest {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid cache manifest {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        Self::from_manifest(manifest)
    }

    pub fn from_manifest(manifest: Manifest) -> anyhow::Result<Self> {
        Ok(Self {
            index: Mutex::new(CacheIndex::new(manifest)?),
        })
    }

    /// An empty cache: every request fails to resolve.
    pub fn empty() -> Self {
        Self {
            index: Mutex::new(CacheIndex::default()),
        }
    }

    pub fn class_count(&self) -> usize {
        self.index.lock().classes.len()
    }

    pub fn method_count(&self) -> usize {
        self.index.lock().classes.iter().map(|c| c.methods.len()).sum()
    }

    /// Number of times the cache has been entered.
    pub fn lookups(&self) -> u64 {
        self.index.lock().lookups
    }
}

/// Exclusive access to a [`ManifestCache`], held until dropped.
pub struct ManifestAccess<'a> {
    index: MutexGuard<'a, CacheIndex>,
}

impl SharedCache for ManifestCache {
    type Access<'a> = ManifestAccess<'a>;

    fn enter(&self) -> ManifestAccess<'_> {
        let mut index = self.index.lock();
        index.lookups += 1;
        ManifestAccess { index }
    }
}

impl CacheAccess for ManifestAccess<'_> {
    fn resolve_symbol(&self, offsets: &MethodOffsets) -> Option<MethodIdentity> {
        let class = self.index.class(offsets.class)?;
        let (method_name, signature) = match self.index.method(offsets) {
            Some((_, _, method)) => (method.name.clone(), method.signature.clone()),
            None => (format!("<method@{:#x}>", offsets.method), String::new()),
        };
        Some(MethodIdentity {
            offsets: *offsets,
            class_name: class.name.clone(),
            method_name,
            signature,
        })
    }

    fn has_cached_artifact(&self, method: &MethodIdentity) -> bool {
        self.index
            .method(&method.offsets)
            .is_some_and(|(_, _, entry)| entry.cached)
    }

    fn resolve_method(&self, method: &MethodIdentity) -> Option<MethodHandle> {
        let (index, entry) = self.index.loaded_method(&method.offsets)?;
        if !entry.is_executable() {
            return None;
        }
        Some(MethodHandle {
            identity: method.clone(),
            index: u32::try_from(index).ok()?,
        })
    }
}
