// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared test fixture: a three-space workspace with a trusted signing
//! key, so chain tests can author signed tools in one line.

use crate::chain::{Chain, build_chain};
use std::path::PathBuf;
use strand_core::{ItemId, ItemKind, Space};
use strand_integrity::{KeyPair, TrustStore, VerifyCache, sign_content};
use strand_resolve::SpaceLayout;

pub(crate) struct Workspace {
    _dirs: Vec<tempfile::TempDir>,
    pub layout: SpaceLayout,
    pub key: KeyPair,
    pub store: TrustStore,
    pub cache: VerifyCache,
}

impl Workspace {
    pub fn new() -> Self {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let layout = SpaceLayout {
            project: dirs[0].path().to_path_buf(),
            user: dirs[1].path().to_path_buf(),
            system: dirs[2].path().to_path_buf(),
        };
        let key = KeyPair::generate();
        let mut store = TrustStore::new();
        store.insert(key.fingerprint.clone(), key.signing.verifying_key());
        Self {
            _dirs: dirs,
            layout,
            key,
            store,
            cache: VerifyCache::new(),
        }
    }

    pub fn put_tool(&self, id: &str, yaml: &str) {
        self.put_tool_in(Space::Project, id, yaml);
    }

    pub fn put_tool_in(&self, space: Space, id: &str, yaml: &str) {
        let path = self
            .layout
            .item_dir(space, ItemKind::Tool)
            .join(format!("{id}.yaml"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, sign_content(yaml, &self.key, "yaml")).unwrap();
    }

    pub fn tool_path(&self, id: &str) -> PathBuf {
        self.layout
            .item_dir(Space::Project, ItemKind::Tool)
            .join(format!("{id}.yaml"))
    }

    pub fn build(&self, id: &ItemId) -> strand_error::Result<Chain> {
        build_chain(&self.layout, &self.store, &self.cache, id)
    }
}
