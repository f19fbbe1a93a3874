//! uid/gid to name lookups for the `*name` labels.

use log::Level;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

pub trait NameResolver: Send + Sync {
    fn user(&self, uid: u32) -> Option<Arc<str>>;
    fn group(&self, gid: u32) -> Option<Arc<str>>;
}

type NameDb = HashMap<u32, Arc<str>>;

/// Reads the colon-separated account databases once, on first use.
/// Unknown ids resolve to nothing; the numeric field is still logged.
#[derive(Debug)]
pub struct SystemNames {
    passwd: PathBuf,
    group:  PathBuf,
    users:  OnceLock<NameDb>,
    groups: OnceLock<NameDb>,
}

impl SystemNames {
    pub fn new() -> Self {
        Self::with_files("/etc/passwd", "/etc/group")
    }

    pub fn with_files(passwd: impl Into<PathBuf>, group: impl Into<PathBuf>) -> Self {
        Self {
            passwd: passwd.into(),
            group:  group.into(),
            users:  OnceLock::new(),
            groups: OnceLock::new(),
        }
    }
}

impl Default for SystemNames {
    fn default() -> Self {
        Self::new()
    }
}

impl NameResolver for SystemNames {
    fn user(&self, uid: u32) -> Option<Arc<str>> {
        self.users.get_or_init(|| load(&self.passwd)).get(&uid).cloned()
    }

    fn group(&self, gid: u32) -> Option<Arc<str>> {
        self.groups.get_or_init(|| load(&self.group)).get(&gid).cloned()
    }
}

fn load(path: &Path) -> NameDb {
    match std::fs::read_to_string(path) {
        Ok(text) => parse(&text),
        Err(e) => {
            hostmon_log!(Level::Warn, "output", "cannot read {}: {}", path.display(), e);
            NameDb::new()
        }
    }
}

/// `name:passwd:id:...`; first entry for an id wins.
fn parse(text: &str) -> NameDb {
    let mut db = NameDb::new();
    for line in text.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(name), Some(_), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(id) = id.trim().parse::<u32>() {
            db.entry(id).or_insert_with(|| Arc::from(name));
        }
    }
    db
}
