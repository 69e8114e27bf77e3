//! The small `meta.json` sidecar a deployed VM writes next to its call log
//! and files archive, recording the two URLs that must agree with the
//! log's own `init` entry on every subsequent open (spec §4.4's open-time
//! assertion, §12 open question 2).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmMeta {
    pub title: String,
    pub log_url: String,
    pub files_archive_url: String,
}

const META_FILE: &str = "meta.json";

impl VmMeta {
    pub fn write(dir: &Path, meta: &VmMeta) -> CoreResult<()> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(meta)?;
        fs::write(dir.join(META_FILE), json)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> CoreResult<VmMeta> {
        let json = fs::read_to_string(dir.join(META_FILE))?;
        Ok(serde_json::from_str(&json)?)
    }
}
