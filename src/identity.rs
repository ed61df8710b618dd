//! Logical identity of a transferable file

use crate::action::Action;
use crate::protocol::keys;
use std::fmt;
use std::path::{Path, PathBuf};

/// The five-field address of a logical file.
///
/// `key()` is the globally unique name used for the registry and as the file
/// name on the receiving side. Collisions are the caller's problem.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    id: String,
    kind: String,
    date: String,
    begin: String,
    end: String,
}

impl FileIdentity {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        date: impl Into<String>,
        begin: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            date: date.into(),
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// Build from the ID/TYPE/DATE/BEGIN/END options of a handshake.
    /// Missing options become empty fields; see `check_storable`.
    pub fn from_action(action: &Action) -> Self {
        let get = |k: &str| action.get(k).unwrap_or_default().to_string();
        Self {
            id: get(keys::ID),
            kind: get(keys::TYPE),
            date: get(keys::DATE),
            begin: get(keys::BEGIN),
            end: get(keys::END),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn kind(&self) -> &str {
        &self.kind
    }
    pub fn date(&self) -> &str {
        &self.date
    }
    pub fn begin(&self) -> &str {
        &self.begin
    }
    pub fn end(&self) -> &str {
        &self.end
    }

    pub fn key(&self) -> String {
        [
            self.id.as_str(),
            &self.kind,
            &self.date,
            &self.begin,
            &self.end,
        ]
        .join("_")
    }

    /// Reject identities that cannot name a file under the receive root:
    /// empty fields, path separators, or a `.`/`..` kind.
    pub fn check_storable(&self) -> Result<(), String> {
        for (name, value) in self.options() {
            if value.is_empty() {
                return Err(format!("{} is empty", name));
            }
            if value.contains(['/', '\\', '\0']) {
                return Err(format!("{} contains a path separator", name));
            }
        }
        if self.kind == "." || self.kind == ".." {
            return Err(format!("TYPE {:?} is not a directory name", self.kind));
        }
        Ok(())
    }

    /// Handshake options in wire order.
    pub fn options(&self) -> [(&'static str, &str); 5] {
        [
            (keys::ID, &self.id),
            (keys::TYPE, &self.kind),
            (keys::DATE, &self.date),
            (keys::BEGIN, &self.begin),
            (keys::END, &self.end),
        ]
    }

    /// `<root>/<kind>/<key>`
    pub fn storage_path(&self, root: &Path) -> PathBuf {
        root.join(&self.kind).join(self.key())
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
