use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The distribution's core package is advertised under its historical name in
/// dependency lists; the built catalog knows it as `base`.
const CORE_ALIAS: &str = "racket";
const CORE_NAME: &str = "base";

/// Map a dependency name onto the name the catalog actually serves.
#[must_use]
pub fn remap_dependency(name: &str) -> &str {
    if name == CORE_ALIAS {
        CORE_NAME
    } else {
        name
    }
}

/// A dependency as it appears in catalog details: either a bare package name
/// or a structured spec whose first element is the name (the remaining
/// elements carry version/platform qualifiers the planner does not use).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    Name(String),
    Spec(Vec<serde_json::Value>),
}

impl Dependency {
    /// The package name this dependency refers to, already remapped. A spec
    /// whose first element is not a string yields `None` and is ignored.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Dependency::Name(name) => Some(remap_dependency(name)),
            Dependency::Spec(parts) => parts
                .first()
                .and_then(serde_json::Value::as_str)
                .map(remap_dependency),
        }
    }
}

/// One catalog entry. `source` is a URL or a path relative to the catalog
/// root; `checksum` is the SHA-256 of the source archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageDetails {
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

impl PackageDetails {
    /// Dependency names, remapped, with malformed specs dropped.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter_map(Dependency::name)
    }
}

/// A catalog: package name to details, ordered for stable serialization.
pub type PackageMap = BTreeMap<String, PackageDetails>;
