//! CubicWeb core library: schema model, SQL generation, system source,
//! migrations, integrity checks and backups.
//!
//! The main entry point is [`instance::Instance`], which ties an
//! `instance.toml` configuration, the cubes it uses and its database
//! together. Lower layers ([`schema`], [`sql`], [`store`], [`migrate`]) are
//! usable on their own against any [`store::SystemSource`].

use cubicweb_deps::Version;

pub mod backup;
pub mod config;
pub mod cube;
pub mod error;
pub mod fti;
pub mod instance;
pub mod integrity;
pub mod migrate;
pub mod progress;
pub mod schema;
pub mod sql;
pub mod store;

/// Version of the framework, recorded as the `cubicweb` pseudo-cube.
pub fn framework_version() -> Version {
    let parse = |s: &str| s.parse().unwrap_or(0);
    Version::new(
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}
