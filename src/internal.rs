use crate::{Gateway, KBConfig, KnowledgeBase};
use crate::markers::SnpDefinition;
use crate::utils;

use tempfile::TempDir;

//-----------------------------------------------------------------------------

// Credentials used in the tests.

pub(crate) const USER: &str = "tester";
pub(crate) const PASSWORD: &str = "correct horse battery staple";

pub(crate) fn create_config(dir: &TempDir) -> KBConfig {
    let host = dir.path().join("kb.db");
    assert!(!utils::file_exists(&host), "Database {} already exists", host.display());
    KBConfig::new(host, USER, PASSWORD)
}

fn create_dir() -> TempDir {
    let dir = tempfile::tempdir();
    assert!(dir.is_ok(), "Failed to create a temporary directory: {}", dir.unwrap_err());
    dir.unwrap()
}

//-----------------------------------------------------------------------------

// Backend utilities.

pub(crate) fn create_gateway() -> (TempDir, Gateway) {
    let dir = create_dir();
    let config = create_config(&dir);
    let gateway = Gateway::create(&config);
    assert!(gateway.is_ok(), "Failed to create backend: {}", gateway.unwrap_err());
    (dir, gateway.unwrap())
}

pub(crate) fn create_kb() -> (TempDir, KnowledgeBase) {
    let dir = create_dir();
    let config = create_config(&dir);
    let kb = KnowledgeBase::create(&config);
    assert!(kb.is_ok(), "Failed to create knowledge base: {}", kb.unwrap_err());
    (dir, kb.unwrap())
}

//-----------------------------------------------------------------------------

// Marker data.

pub(crate) const MASK: &str = "GGATACATTTTATTGC[A/G]CTTGCAGAGTATTTTT";

pub(crate) fn example_definitions(n: usize) -> Vec<SnpDefinition> {
    (0..n).map(|i| SnpDefinition {
        source: String::from("affymetrix"),
        context: String::from("GW6.0"),
        label: format!("foo-{:06}", i),
        rs_label: format!("rs{}", 1000 + i),
        mask: MASK.to_string(),
    }).collect()
}

//-----------------------------------------------------------------------------
