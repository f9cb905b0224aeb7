// Commands available to migration scripts and doctests.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{MigrationError, Result};
use crate::store::Row;

use super::MigrationHelper;

/// Runs one command. Returns the text a doctest compares, if any.
pub type Handler = fn(&mut MigrationHelper<'_>, &[String]) -> Result<Option<String>>;

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub usage: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    handler: Handler,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Check the argument count, then run.
    pub fn call(self, helper: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
        if args.len() < self.min_args || args.len() > self.max_args {
            return Err(MigrationError::Usage {
                command: self.name,
                usage: self.usage,
            }
            .into());
        }
        (self.handler)(helper, args)
    }
}

/// Command name to handler, built once per migration run.
#[derive(Debug, Clone)]
pub struct CommandTable {
    commands: BTreeMap<&'static str, Command>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        let mut table = Self {
            commands: BTreeMap::new(),
        };
        table.register("add_cube", "add_cube <cube>", 1, 1, add_cube);
        table.register("add_entity_type", "add_entity_type <etype>", 1, 1, add_entity_type);
        table.register("drop_entity_type", "drop_entity_type <etype>", 1, 1, drop_entity_type);
        table.register("rename_entity_type", "rename_entity_type <old> <new>", 2, 2, rename_entity_type);
        table.register("add_relation_type", "add_relation_type <rtype>", 1, 1, add_relation_type);
        table.register("drop_relation_type", "drop_relation_type <rtype>", 1, 1, drop_relation_type);
        table.register(
            "rename_relation_type",
            "rename_relation_type <old> <new>",
            2,
            2,
            rename_relation_type,
        );
        table.register(
            "add_relation_definition",
            "add_relation_definition <subject> <rtype> <object>",
            3,
            3,
            add_relation_definition,
        );
        table.register(
            "drop_relation_definition",
            "drop_relation_definition <subject> <rtype> <object>",
            3,
            3,
            drop_relation_definition,
        );
        table.register("add_attribute", "add_attribute <etype> <attr>", 2, 2, add_attribute);
        table.register("drop_attribute", "drop_attribute <etype> <attr>", 2, 2, drop_attribute);
        table.register("rename_attribute", "rename_attribute <etype> <old> <new>", 3, 3, rename_attribute);
        table.register(
            "sync_schema_props_perms",
            "sync_schema_props_perms [etype|rtype]",
            0,
            1,
            sync_schema_props_perms,
        );
        table.register("sql", "sql <statement>", 1, 1, sql);
        table.register("commit", "commit", 0, 0, commit);
        table.register("rollback", "rollback", 0, 0, rollback);
        table.register("checkpoint", "checkpoint", 0, 0, checkpoint);
        table.register("set_property", "set_property <key> <value>", 2, 2, set_property);
        table.register("reindex", "reindex [etype...]", 0, usize::MAX, reindex);
        table.register("exit", "exit [status]", 0, 1, exit);
        table
    }

    fn register(&mut self, name: &'static str, usage: &'static str, min_args: usize, max_args: usize, handler: Handler) {
        self.commands.insert(
            name,
            Command {
                name,
                usage,
                min_args,
                max_args,
                handler,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Command> {
        self.commands.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }
}

/// Rows as `|`-separated lines.
pub fn format_rows(rows: &[Row]) -> String {
    rows.iter()
        .map(|row| row.iter().map(ToString::to_string).collect::<Vec<_>>().join("|"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Handlers ──────────────────────────────────────────────────────

fn add_cube(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.add_cube(&args[0])?;
    Ok(None)
}

fn add_entity_type(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().add_entity_type(&args[0])?;
    Ok(None)
}

fn drop_entity_type(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().drop_entity_type(&args[0])?;
    Ok(None)
}

fn rename_entity_type(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().rename_entity_type(&args[0], &args[1])?;
    Ok(None)
}

fn add_relation_type(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().add_relation_type(&args[0])?;
    Ok(None)
}

fn drop_relation_type(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().drop_relation_type(&args[0])?;
    Ok(None)
}

fn rename_relation_type(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().rename_relation_type(&args[0], &args[1])?;
    Ok(None)
}

fn add_relation_definition(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().add_relation_definition(&args[0], &args[1], &args[2])?;
    Ok(None)
}

fn drop_relation_definition(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().drop_relation_definition(&args[0], &args[1], &args[2])?;
    Ok(None)
}

fn add_attribute(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().add_attribute(&args[0], &args[1])?;
    Ok(None)
}

fn drop_attribute(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().drop_attribute(&args[0], &args[1])?;
    Ok(None)
}

fn rename_attribute(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().rename_attribute(&args[0], &args[1], &args[2])?;
    Ok(None)
}

fn sync_schema_props_perms(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.sync_mut().sync_schema_props_perms(args.first().map(String::as_str))?;
    Ok(None)
}

fn sql(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    Ok(h.source().run(&args[0])?.map(|rows| format_rows(&rows)))
}

fn commit(h: &mut MigrationHelper<'_>, _args: &[String]) -> Result<Option<String>> {
    h.commit()?;
    Ok(None)
}

fn rollback(h: &mut MigrationHelper<'_>, _args: &[String]) -> Result<Option<String>> {
    h.rollback()?;
    Ok(None)
}

fn checkpoint(h: &mut MigrationHelper<'_>, _args: &[String]) -> Result<Option<String>> {
    h.checkpoint()?;
    Ok(None)
}

fn set_property(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.set_property(&args[0], &args[1])?;
    Ok(None)
}

fn reindex(h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    h.reindex((!args.is_empty()).then_some(args))?;
    Ok(None)
}

fn exit(_h: &mut MigrationHelper<'_>, args: &[String]) -> Result<Option<String>> {
    let status = match args.first() {
        None => 0,
        Some(s) => s.parse().map_err(|_| MigrationError::Usage {
            command: "exit",
            usage: "exit [status]",
        })?,
    };
    Err(MigrationError::Exit(status).into())
}
