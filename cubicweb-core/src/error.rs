use std::path::PathBuf;

/// Top-level CubicWeb error type.
///
/// All fallible operations in `cubicweb-core` return [`Result<T, CwError>`](Result).
/// Each variant wraps a domain-specific error enum, allowing callers to
/// match on the error source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum CwError {
    /// Error from the system source (`SQLite` operations, introspection).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Error while building or loading a schema.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error while running a migration.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Error in instance or cube configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error while writing or reading a backup archive.
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Error from the cube dependency engine.
    #[error("Dependency error: {0}")]
    Deps(#[from] cubicweb_deps::DepsError),
}

/// Errors from the SQL-executing system source.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection lock was poisoned by a panicking holder.
    #[error("Connection lock poisoned")]
    Poisoned,

    /// No row in the `entities` table for this eid.
    #[error("Unknown entity: {0}")]
    UnknownEntity(i64),

    /// The backend cannot perform the requested operation.
    #[error("Unsupported by the {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },

    /// Filesystem I/O error (database file, dumps).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while building, loading or querying a schema.
#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown relation type: {0}")]
    UnknownRelationType(String),

    #[error("Unknown relation definition: {subject} {rtype} {object}")]
    UnknownRelationDefinition {
        subject: String,
        rtype: String,
        object: String,
    },

    /// An element with this name is already defined.
    #[error("Duplicate schema element: {0}")]
    Duplicate(String),

    #[error("Invalid cardinality: {0:?}")]
    InvalidCardinality(String),

    /// Definition is syntactically valid but semantically wrong.
    #[error("Invalid definition of {element}: {message}")]
    Invalid { element: String, message: String },

    /// Schema file syntax could not be parsed (TOML error).
    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Persisted schema rows could not be decoded.
    #[error("Corrupted persisted schema: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while selecting or executing migrations.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Bad arguments for {command}, usage: {usage}")]
    Usage {
        command: &'static str,
        usage: &'static str,
    },

    #[error("Unparsable command line: {0}")]
    Syntax(String),

    #[error("Unknown script extension for {path}, allowed: {allowed}")]
    UnknownExtension { path: PathBuf, allowed: String },

    /// A command failed inside a script; `line` is 1-based.
    #[error("{path}:{line}: {source}")]
    Script {
        path: PathBuf,
        line: usize,
        #[source]
        source: Box<CwError>,
    },

    #[error("{path}:{line}: expected {expected:?}, got {got:?}")]
    DoctestFailed {
        path: PathBuf,
        line: usize,
        expected: String,
        got: String,
    },

    /// SQL scripts need repository access, which web-only instances lack.
    #[error("Cannot run SQL script {0} without repository access")]
    NoRepository(PathBuf),

    #[error("Cannot downgrade {cube} from {installed} to {available}")]
    Downgrade {
        cube: String,
        installed: String,
        available: String,
    },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// The user chose to abort; the transaction has been rolled back.
    #[error("Migration aborted by user")]
    Aborted,

    /// A script requested process exit with this status.
    #[error("Script requested exit with status {0}")]
    Exit(i32),
}

/// Errors in instance and cube configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown cube: {0}")]
    UnknownCube(String),

    /// Installed cube versions do not satisfy declared dependencies.
    #[error("Unsatisfied dependencies: {}", .0.join("; "))]
    Dependencies(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from backup archive handling.
#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive content does not follow the expected layout.
    #[error("Invalid archive: {0}")]
    Format(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `Result<T, CwError>`.
pub type Result<T> = std::result::Result<T, CwError>;
