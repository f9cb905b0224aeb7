// Instance fixtures for integration tests: a temporary directory holding
// `instance.toml` and the cubes it uses.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use cubicweb_core::instance::Instance;

/// Schema of the `people` cube used by most scenarios.
pub const PERSON_SCHEMA: &str = "\
[entity.Person]

[[entity.Person.attribute]]
name = \"name\"
type = \"String\"
required = true
maxsize = 64
fulltextindexed = true
";

/// A temporary instance directory. Non-interactive, never backs up
/// before upgrades.
#[derive(Debug)]
pub struct TestInstance {
    pub dir: tempfile::TempDir,
    name: String,
    cubes: Vec<String>,
}

impl TestInstance {
    /// An instance named `name` using `cubes`.
    pub fn new(name: &str, cubes: &[&str]) -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().expect("create tempdir"),
            name: name.to_string(),
            cubes: cubes.iter().map(ToString::to_string).collect(),
        };
        fixture.write_config();
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("instance.toml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.path().join(format!("{}.sqlite", self.name))
    }

    fn write_config(&self) {
        let cubes: Vec<String> = self.cubes.iter().map(|c| format!("{c:?}")).collect();
        let text = format!(
            "[instance]\nname = {:?}\ncubes = [{}]\n\n\
             [database]\ndriver = \"sqlite\"\npath = \"{}.sqlite\"\n\n\
             [migration]\ninteractive = false\nbackup = \"never\"\n",
            self.name,
            cubes.join(", "),
            self.name,
        );
        write_file(&self.config_path(), &text);
    }

    /// Write (or overwrite) `cubes/<name>/cube.toml`.
    pub fn cube(&self, name: &str, version: &str, depends: &[(&str, &str)]) -> &Self {
        let mut text = format!("[cube]\nname = {name:?}\nversion = {version:?}\n\n[depends]\n");
        for (dep, constraint) in depends {
            let _ = writeln!(text, "{dep} = {constraint:?}");
        }
        write_file(&self.cube_dir(name).join("cube.toml"), &text);
        self
    }

    pub fn schema(&self, cube: &str, text: &str) -> &Self {
        write_file(&self.cube_dir(cube).join("schema.toml"), text);
        self
    }

    /// Write a script in the cube's `migration/` directory.
    pub fn migration(&self, cube: &str, file: &str, text: &str) -> &Self {
        write_file(&self.cube_dir(cube).join("migration").join(file), text);
        self
    }

    pub fn cube_dir(&self, name: &str) -> PathBuf {
        self.path().join("cubes").join(name)
    }

    /// Load the instance as it currently is on disk.
    pub fn instance(&self) -> Instance {
        Instance::load(&self.config_path()).expect("load instance")
    }
}

fn write_file(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture directory");
    }
    std::fs::write(path, text).expect("write fixture file");
}
