//! Structured view of a `CREATE TABLE` statement.
//!
//! The migration needs exactly two edits to a table's definition: point it at
//! the backup table name and make it use the target storage policy. The
//! statement is parsed once into identifier, body and settings, edited as
//! data and rendered back.

use crate::migration::MigrationError;
use crate::sql::{
    find_keyword, normalize_whitespace, qualified, quote_identifier, quote_literal,
    split_top_level, unquote_identifier, Scanner,
};
use std::fmt;

/// Setting name that selects a table's storage policy.
pub const STORAGE_POLICY_SETTING: &str = "storage_policy";

/// One `name = value` entry of a `SETTINGS` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    /// Setting name.
    pub name: String,
    /// Raw value text (literals keep their quotes).
    pub value: String,
}

/// How the storage policy gets into the settings list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsRule {
    /// A `storage_policy` setting exists; its value is replaced.
    Replace,
    /// A `SETTINGS` clause exists without `storage_policy`; it is appended.
    Append,
    /// No `SETTINGS` clause; one is introduced after the engine declaration.
    Introduce,
}

impl SettingsRule {
    /// Pick the rule for a settings list.
    pub fn select(settings: &[Setting]) -> Self {
        if settings
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(STORAGE_POLICY_SETTING))
        {
            SettingsRule::Replace
        } else if !settings.is_empty() {
            SettingsRule::Append
        } else {
            SettingsRule::Introduce
        }
    }
}

/// A parsed `CREATE TABLE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    head: String,
    database: Option<String>,
    table: String,
    body: String,
    settings: Vec<Setting>,
    tail: String,
}

impl TableDefinition {
    /// Parse the text returned by `SHOW CREATE TABLE`.
    pub fn parse(statement: &str) -> Result<Self, MigrationError> {
        let statement = normalize_whitespace(statement.trim().trim_end_matches(';'));

        let mut head_len = prefix_len(&statement, "CREATE TABLE ")
            .ok_or_else(|| MigrationError::Ddl(format!("not a CREATE TABLE statement: {statement}")))?;
        if let Some(len) = prefix_len(&statement[head_len..], "IF NOT EXISTS ") {
            head_len += len;
        }
        let head = statement[..head_len].trim().to_string();

        let rest = &statement[head_len..];
        let ident_end = identifier_end(rest);
        if ident_end == 0 {
            return Err(MigrationError::Ddl(format!("missing table name: {statement}")));
        }
        let (database, table) = split_identifier(&rest[..ident_end]);
        let after_ident = &rest[ident_end..];

        let engine_at = find_keyword(after_ident, "ENGINE", 0)
            .ok_or_else(|| MigrationError::Ddl(format!("missing ENGINE clause: {statement}")))?;
        let comment_at = find_keyword(after_ident, "COMMENT", engine_at);
        let settings_at = find_keyword(after_ident, "SETTINGS", engine_at)
            .filter(|pos| comment_at.map_or(true, |c| *pos < c));

        let clause_end = comment_at.unwrap_or(after_ident.len());
        let tail = after_ident[clause_end..].trim().to_string();

        let (body, settings) = match settings_at {
            Some(pos) => {
                let list = &after_ident[pos + "SETTINGS".len()..clause_end];
                (after_ident[..pos].trim().to_string(), parse_settings(list)?)
            }
            None => (after_ident[..clause_end].trim().to_string(), Vec::new()),
        };

        Ok(Self {
            head,
            database,
            table,
            body,
            settings,
            tail,
        })
    }

    /// Database named in the statement, if qualified.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Settings in declaration order.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Current storage policy, unquoted.
    pub fn storage_policy(&self) -> Option<&str> {
        self.settings
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(STORAGE_POLICY_SETTING))
            .map(|s| unquote_identifier(&s.value))
    }

    /// Whether the table already uses `policy`.
    pub fn uses_storage_policy(&self, policy: &str) -> bool {
        self.storage_policy() == Some(policy)
    }

    /// Rename the table, keeping its database.
    pub fn rename(&mut self, table: impl Into<String>) {
        self.table = table.into();
    }

    /// Qualify an unqualified definition with `database`.
    pub fn qualify(&mut self, database: &str) {
        if self.database.is_none() {
            self.database = Some(database.to_string());
        }
    }

    /// Point the definition at `policy`, returning the rule that was applied.
    pub fn set_storage_policy(&mut self, policy: &str) -> SettingsRule {
        let rule = SettingsRule::select(&self.settings);
        let value = quote_literal(policy);
        match rule {
            SettingsRule::Replace => {
                for setting in self
                    .settings
                    .iter_mut()
                    .filter(|s| s.name.eq_ignore_ascii_case(STORAGE_POLICY_SETTING))
                {
                    setting.value = value.clone();
                }
            }
            SettingsRule::Append | SettingsRule::Introduce => self.settings.push(Setting {
                name: STORAGE_POLICY_SETTING.to_string(),
                value,
            }),
        }
        rule
    }

    /// Definition of the backup table: same database, `<table><suffix>`,
    /// target storage policy.
    pub fn backup_definition(&self, suffix: &str, policy: &str) -> (Self, SettingsRule) {
        let mut backup = self.clone();
        backup.rename(format!("{}{}", self.table, suffix));
        let rule = backup.set_storage_policy(policy);
        (backup, rule)
    }
}

impl fmt::Display for TableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.head)?;
        match &self.database {
            Some(db) => write!(f, "{}", qualified(db, &self.table))?,
            None => write!(f, "{}", quote_identifier(&self.table))?,
        }
        if !self.body.is_empty() {
            write!(f, " {}", self.body)?;
        }
        if !self.settings.is_empty() {
            let list: Vec<String> = self
                .settings
                .iter()
                .map(|s| format!("{} = {}", s.name, s.value))
                .collect();
            write!(f, " SETTINGS {}", list.join(", "))?;
        }
        if !self.tail.is_empty() {
            write!(f, " {}", self.tail)?;
        }
        Ok(())
    }
}

fn prefix_len(input: &str, prefix: &str) -> Option<usize> {
    let candidate = input.get(..prefix.len())?;
    candidate.eq_ignore_ascii_case(prefix).then_some(prefix.len())
}

/// End of the leading identifier (`db.table`, `` `db`.`table` ``).
fn identifier_end(input: &str) -> usize {
    let mut scanner = Scanner::default();
    for (idx, c) in input.char_indices() {
        let top_level = scanner.step(c);
        if top_level && (c.is_whitespace() || c == '(') {
            return idx;
        }
    }
    input.len()
}

fn split_identifier(ident: &str) -> (Option<String>, String) {
    let mut scanner = Scanner::default();
    for (idx, c) in ident.char_indices() {
        if scanner.step(c) && c == '.' {
            return (
                Some(unquote_identifier(&ident[..idx]).to_string()),
                unquote_identifier(&ident[idx + 1..]).to_string(),
            );
        }
    }
    (None, unquote_identifier(ident).to_string())
}

fn parse_settings(list: &str) -> Result<Vec<Setting>, MigrationError> {
    split_top_level(list)
        .into_iter()
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| MigrationError::Ddl(format!("malformed setting `{entry}`")))?;
            Ok(Setting {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}
