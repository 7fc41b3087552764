//! Static coding rules loaded once per process.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::stage::StaticRules;

/// Read rules text from `path`; a missing file yields empty rules.
pub fn load_rules(path: Option<&Path>) -> Result<StaticRules> {
    let Some(path) = path else {
        return Ok(StaticRules::default());
    };
    match fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), bytes = text.len(), "rules loaded");
            Ok(StaticRules::new(text))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "rules file not found, continuing without rules");
            Ok(StaticRules::default())
        }
        Err(err) => Err(err).with_context(|| format!("read rules {}", path.display())),
    }
}
