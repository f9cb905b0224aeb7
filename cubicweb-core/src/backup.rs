//! Database backups as `tar.gz` archives.
//!
//! An archive holds `format.txt` (`native` or `portable`), `versions.txt`
//! (one `<cube> <version>` line per installed cube) and the data: a copy of
//! the database file (`system.sqlite`) in native format, or one JSON
//! document per table (`tables/<table>.json`) in portable format.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cubicweb_deps::Version;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BackupError, Result};
use crate::store::entities::SYSTEM_SOURCE;
use crate::store::{Row, SystemSource};

pub const FORMAT_FILE: &str = "format.txt";
pub const VERSIONS_FILE: &str = "versions.txt";
const TABLES_DIR: &str = "tables/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupFormat {
    /// Copy of the database file, restorable on the same backend only.
    #[default]
    Native,
    /// Table rows as JSON, restorable into any database holding the same
    /// tables.
    Portable,
}

impl BackupFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Portable => "portable",
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "native" => Ok(Self::Native),
            "portable" => Ok(Self::Portable),
            other => Err(BackupError::Format(format!(
                "unknown backup format {other:?}, expected native or portable"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TableDump {
    columns: Vec<String>,
    rows: Vec<Row>,
}

fn native_file() -> String {
    format!("{SYSTEM_SOURCE}.sqlite")
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn render_versions(versions: &BTreeMap<String, Version>) -> String {
    versions
        .iter()
        .map(|(cube, version)| format!("{cube} {version}\n"))
        .collect()
}

fn parse_versions(text: &str) -> std::result::Result<BTreeMap<String, Version>, BackupError> {
    let mut versions = BTreeMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (cube, version) = line
            .split_once(' ')
            .ok_or_else(|| BackupError::Format(format!("bad versions line {line:?}")))?;
        let version = version
            .trim()
            .parse()
            .map_err(|e| BackupError::Format(format!("{cube}: {e}")))?;
        versions.insert(cube.to_string(), version);
    }
    Ok(versions)
}

// ── Writing ───────────────────────────────────────────────────────

type ArchiveBuilder = tar::Builder<GzEncoder<File>>;

fn append_bytes(builder: &mut ArchiveBuilder, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0));
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

fn dump_tables(source: &dyn SystemSource, builder: &mut ArchiveBuilder) -> Result<usize> {
    let tables = source.table_names()?;
    for table in &tables {
        let columns = source.table_columns(table)?;
        let select = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let rows = source.query(&format!("SELECT {select} FROM {}", quote(table)), &[])?;
        debug!(table, rows = rows.len(), "Table dumped");
        let json = serde_json::to_vec(&TableDump { columns, rows }).map_err(BackupError::from)?;
        append_bytes(builder, &format!("{TABLES_DIR}{table}.json"), &json).map_err(BackupError::from)?;
    }
    Ok(tables.len())
}

/// Write a backup of `source` into `directory` as
/// `<instance>-<YYYYmmddHHMMSS>.tar.gz`. Returns the archive path.
pub fn backup(
    source: &dyn SystemSource,
    instance: &str,
    versions: &BTreeMap<String, Version>,
    format: BackupFormat,
    directory: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(directory).map_err(BackupError::from)?;
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let path = directory.join(format!("{instance}-{stamp}.tar.gz"));
    let file = File::create(&path).map_err(BackupError::from)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    append_bytes(&mut builder, FORMAT_FILE, format.as_str().as_bytes()).map_err(BackupError::from)?;
    append_bytes(&mut builder, VERSIONS_FILE, render_versions(versions).as_bytes())
        .map_err(BackupError::from)?;
    match format {
        BackupFormat::Native => {
            let dump = directory.join(format!(".{instance}-{stamp}.sqlite"));
            source.dump(&dump)?;
            let appended = builder.append_path_with_name(&dump, native_file());
            std::fs::remove_file(&dump).map_err(BackupError::from)?;
            appended.map_err(BackupError::from)?;
        }
        BackupFormat::Portable => {
            dump_tables(source, &mut builder)?;
        }
    }
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(BackupError::from)?;
    info!(path = %path.display(), %format, "Backup written");
    Ok(path)
}

// ── Reading ───────────────────────────────────────────────────────

/// Content of a backup archive, read fully in memory.
#[derive(Debug)]
pub struct Archive {
    pub format: BackupFormat,
    pub versions: BTreeMap<String, Version>,
    files: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(BackupError::from)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut files = BTreeMap::new();
        for entry in archive.entries().map_err(BackupError::from)? {
            let mut entry = entry.map_err(BackupError::from)?;
            let name = entry.path().map_err(BackupError::from)?.to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(BackupError::from)?;
            files.insert(name, bytes);
        }

        let text = |name: &str| -> std::result::Result<String, BackupError> {
            let bytes = files
                .get(name)
                .ok_or_else(|| BackupError::Format(format!("{name} missing")))?;
            String::from_utf8(bytes.clone()).map_err(|e| BackupError::Format(format!("{name}: {e}")))
        };
        let format: BackupFormat = text(FORMAT_FILE)?.parse()?;
        let versions = parse_versions(&text(VERSIONS_FILE)?)?;
        if format == BackupFormat::Native && !files.contains_key(&native_file()) {
            return Err(BackupError::Format(format!("{} missing", native_file())).into());
        }
        Ok(Self {
            format,
            versions,
            files,
        })
    }

    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Tables of a portable archive.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.files.keys().filter_map(|name| {
            name.strip_prefix(TABLES_DIR)
                .and_then(|rest| rest.strip_suffix(".json"))
        })
    }
}

fn load_tables(source: &dyn SystemSource, archive: &Archive) -> Result<usize> {
    let existing = source.table_names()?;
    let mut count = 0;
    for table in archive.tables() {
        if !existing.contains(table) {
            return Err(BackupError::Format(format!("no table {table} in the target database")).into());
        }
        let bytes = archive.file(&format!("{TABLES_DIR}{table}.json")).unwrap_or_default();
        let dump: TableDump = serde_json::from_slice(bytes).map_err(BackupError::from)?;
        source.execute(&format!("DELETE FROM {}", quote(table)), &[])?;
        let columns = dump.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let marks = vec!["?"; dump.columns.len()].join(", ");
        let insert = format!("INSERT INTO {} ({columns}) VALUES ({marks})", quote(table));
        for row in &dump.rows {
            source.execute(&insert, row)?;
        }
        count += 1;
    }
    Ok(count)
}

/// Replace the content of `source` with the archive's. Returns the cube
/// versions recorded at backup time.
pub fn restore(source: &dyn SystemSource, path: &Path) -> Result<BTreeMap<String, Version>> {
    let archive = Archive::open(path)?;
    match archive.format {
        BackupFormat::Native => {
            let bytes = archive.file(&native_file()).unwrap_or_default();
            let staged = std::env::temp_dir().join(format!("cubicweb-restore-{}.sqlite", std::process::id()));
            std::fs::write(&staged, bytes).map_err(BackupError::from)?;
            let loaded = source.load_dump(&staged);
            std::fs::remove_file(&staged).map_err(BackupError::from)?;
            loaded?;
        }
        BackupFormat::Portable => {
            let own_transaction = !source.in_transaction();
            if own_transaction {
                source.begin()?;
            }
            match load_tables(source, &archive) {
                Ok(_) if own_transaction => source.commit()?,
                Ok(_) => {}
                Err(e) => {
                    if own_transaction {
                        source.rollback()?;
                    }
                    return Err(e);
                }
            }
        }
    }
    info!(path = %path.display(), format = %archive.format, "Backup restored");
    Ok(archive.versions)
}
