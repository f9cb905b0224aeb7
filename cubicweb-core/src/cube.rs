//! Cube manifests (`cube.toml`) and cube discovery.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use cubicweb_deps::Version;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    cube: CubeSection,
    #[serde(default)]
    depends: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CubeSection {
    name: String,
    version: Version,
    #[serde(default)]
    description: String,
}

/// A cube found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeDefinition {
    pub name: String,
    pub version: Version,
    pub description: String,
    /// Dependency name to optional `"<op> <version>"` constraint.
    pub depends: BTreeMap<String, Option<String>>,
    pub directory: PathBuf,
}

impl CubeDefinition {
    pub fn load(directory: &Path) -> Result<Self, ConfigError> {
        let path = directory.join("cube.toml");
        let text = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&text, directory)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
    }

    fn from_toml_str(text: &str, directory: &Path) -> Result<Self, toml::de::Error> {
        let manifest: Manifest = toml::from_str(text)?;
        Ok(Self {
            name: manifest.cube.name,
            version: manifest.cube.version,
            description: manifest.cube.description,
            depends: manifest
                .depends
                .into_iter()
                .map(|(cube, c)| {
                    let c = c.trim().to_string();
                    (cube, (!c.is_empty()).then_some(c))
                })
                .collect(),
            directory: directory.to_path_buf(),
        })
    }

    pub fn schema_path(&self) -> PathBuf {
        self.directory.join("schema.toml")
    }

    pub fn migration_dir(&self) -> PathBuf {
        self.directory.join("migration")
    }

    pub fn dependency_names(&self) -> BTreeSet<String> {
        self.depends.keys().cloned().collect()
    }
}

/// Find every `<dir>/*/cube.toml` under `paths`. The first directory
/// providing a cube name wins.
pub fn discover_cubes(paths: &[PathBuf]) -> Result<BTreeMap<String, CubeDefinition>, ConfigError> {
    let mut cubes = BTreeMap::new();
    for dir in paths {
        let pattern = dir.join("*").join("cube.toml");
        let Ok(entries) = glob::glob(&pattern.to_string_lossy()) else {
            warn!(pattern = %pattern.display(), "Invalid cube search pattern");
            continue;
        };
        for manifest in entries.flatten() {
            let Some(cube_dir) = manifest.parent() else {
                continue;
            };
            let cube = CubeDefinition::load(cube_dir)?;
            if cubes.contains_key(&cube.name) {
                debug!(cube = %cube.name, path = %cube_dir.display(), "Shadowed cube ignored");
                continue;
            }
            cubes.insert(cube.name.clone(), cube);
        }
    }
    Ok(cubes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_constraints_mean_unconstrained() {
        let cube = CubeDefinition::from_toml_str(
            "[cube]\nname = \"blog\"\nversion = \"1.2\"\n[depends]\ncubicweb = \">= 3.26.0\"\nfile = \"\"\n",
            Path::new("/cubes/blog"),
        )
        .unwrap();
        assert_eq!(cube.version, Version::new(1, 2, 0));
        assert_eq!(cube.depends["cubicweb"].as_deref(), Some(">= 3.26.0"));
        assert_eq!(cube.depends["file"], None);
        assert_eq!(cube.migration_dir(), PathBuf::from("/cubes/blog/migration"));
    }

    #[test]
    fn discovery_finds_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, version) in [("blog", "1.0.0"), ("tag", "0.3.0")] {
            let dir = tmp.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("cube.toml"),
                format!("[cube]\nname = \"{name}\"\nversion = \"{version}\"\n"),
            )
            .unwrap();
        }
        std::fs::create_dir_all(tmp.path().join("not-a-cube")).unwrap();
        let cubes = discover_cubes(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(cubes.keys().collect::<Vec<_>>(), vec!["blog", "tag"]);
        assert_eq!(cubes["tag"].version, Version::new(0, 3, 0));
    }
}
