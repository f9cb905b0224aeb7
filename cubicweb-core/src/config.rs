use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sql::Dialect;

/// Which side of an instance a configuration drives. Migration scripts are
/// selected by the mode encoded in their file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    All,
    Repository,
    Web,
}

impl Mode {
    /// Script modes run under this configuration mode.
    pub fn accepted_modes(self) -> &'static [&'static str] {
        match self {
            Self::All => &["Any", "common", "repository", "web"],
            Self::Repository => &["Any", "common", "repository"],
            Self::Web => &["Any", "common", "web"],
        }
    }

    pub fn accepts(self, mode: &str) -> bool {
        self.accepted_modes().contains(&mode)
    }

    /// Whether the database is reachable under this mode.
    pub fn has_repository(self) -> bool {
        self != Self::Web
    }
}

/// When to dump the database before an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupPolicy {
    #[default]
    Ask,
    Always,
    Never,
}

/// Instance configuration, matching `instance.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance: InstanceSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub migration: MigrationSection,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    pub name: String,
    #[serde(default)]
    pub mode: Mode,
    /// Cubes used by the instance; their dependencies are added implicitly.
    #[serde(default)]
    pub cubes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub driver: Dialect,
    pub path: PathBuf,
    /// Database user granted ownership by `schema-sql --grant`.
    pub user: Option<String>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            driver: Dialect::Sqlite,
            path: PathBuf::from("system.sqlite"),
            user: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    /// Directories searched for `<cube>/cube.toml`.
    pub cubes: Vec<PathBuf>,
    /// Framework migration scripts.
    pub migration: Option<PathBuf>,
    pub backup: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            cubes: vec![PathBuf::from("cubes")],
            migration: None,
            backup: PathBuf::from("backup"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSection {
    pub interactive: bool,
    pub backup: BackupPolicy,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            interactive: true,
            backup: BackupPolicy::Ask,
        }
    }
}

impl InstanceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(&text, &root)
    }

    pub fn from_toml_str(text: &str, root: &Path) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.instance.name.trim().is_empty() {
            return Err(ConfigError::Invalid("instance name is empty".into()));
        }
        config.root = root.to_path_buf();
        Ok(config)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database.path)
    }

    pub fn cube_paths(&self) -> Vec<PathBuf> {
        self.paths.cubes.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.paths.backup)
    }

    pub fn framework_migration_dir(&self) -> Option<PathBuf> {
        self.paths.migration.as_deref().map(|p| self.resolve(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = InstanceConfig::from_toml_str(
            "[instance]\nname = \"demo\"\ncubes = [\"blog\"]\n",
            Path::new("/srv/demo"),
        )
        .unwrap();
        assert_eq!(config.instance.mode, Mode::All);
        assert_eq!(config.database.driver, Dialect::Sqlite);
        assert_eq!(config.migration.backup, BackupPolicy::Ask);
        assert!(config.migration.interactive);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/srv/demo/system.sqlite")
        );
        assert_eq!(config.cube_paths(), vec![PathBuf::from("/srv/demo/cubes")]);
    }

    #[test]
    fn modes_filter_script_modes() {
        assert!(Mode::Repository.accepts("common"));
        assert!(!Mode::Repository.accepts("web"));
        assert!(Mode::Web.accepts("web"));
        assert!(!Mode::Web.accepts("repository"));
        assert!(Mode::All.accepts("repository"));
        assert!(!Mode::Web.has_repository());
    }

    #[test]
    fn rejects_empty_name_and_bad_syntax() {
        let err = InstanceConfig::from_toml_str("[instance]\nname = \"\"\n", Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = InstanceConfig::from_toml_str("[instance", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn parses_migration_policy() {
        let config = InstanceConfig::from_toml_str(
            "[instance]\nname = \"x\"\nmode = \"repository\"\n[migration]\ninteractive = false\nbackup = \"never\"\n[database]\ndriver = \"postgres\"\npath = \"db\"\n",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(config.migration.backup, BackupPolicy::Never);
        assert!(!config.migration.interactive);
        assert_eq!(config.database.driver, Dialect::Postgres);
        assert_eq!(config.instance.mode, Mode::Repository);
    }
}
