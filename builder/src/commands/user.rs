//! User lookup and HOME defaulting for command execution.

use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use nix::unistd::{Gid, Group, Uid, User};

/// HOME used when no user, or `root`, is requested.
pub const DEFAULT_HOME: &str = "/root";

/// A resolved account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    /// Home directory, if the account database records one
    pub home: Option<String>,
}

/// Resolves user and group names to ids.
pub trait UserLookup: Send + Sync {
    /// Look up a user by name or numeric id. `Ok(None)` when unknown.
    fn lookup(&self, name: &str) -> Result<Option<UserInfo>>;

    /// Look up a group by name, returning its gid. `Ok(None)` when unknown.
    fn lookup_group(&self, _name: &str) -> Result<Option<u32>> {
        Ok(None)
    }
}

/// Account database of the host, via `getpwnam(3)` and friends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserLookup for SystemUsers {
    fn lookup(&self, name: &str) -> Result<Option<UserInfo>> {
        let user = match name.parse::<u32>() {
            Ok(uid) => User::from_uid(Uid::from_raw(uid)),
            Err(_) => User::from_name(name),
        }
        .map_err(|e| BuildError::Config(format!("Failed to look up user {}: {}", name, e)))?;

        Ok(user.map(|u| {
            let home = u.dir.to_string_lossy().to_string();
            UserInfo {
                name: u.name,
                uid: u.uid.as_raw(),
                gid: u.gid.as_raw(),
                home: if home.is_empty() { None } else { Some(home) },
            }
        }))
    }

    fn lookup_group(&self, name: &str) -> Result<Option<u32>> {
        let group = match name.parse::<u32>() {
            Ok(gid) => Group::from_gid(Gid::from_raw(gid)),
            Err(_) => Group::from_name(name),
        }
        .map_err(|e| BuildError::Config(format!("Failed to look up group {}: {}", name, e)))?;
        Ok(group.map(|g| g.gid.as_raw()))
    }
}

/// Account database of a build root, read from its `etc/passwd` and
/// `etc/group`.
///
/// Files are read on every lookup so accounts created by earlier `RUN`
/// steps are visible to later ones. A missing file means no accounts.
#[derive(Debug, Clone)]
pub struct RootUsers {
    root: PathBuf,
}

impl RootUsers {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Colon-separated records of `etc/<name>`, comments and blanks skipped.
    fn records(&self, name: &str) -> Result<Vec<Vec<String>>> {
        let path = self.root.join("etc").join(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BuildError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.split(':').map(String::from).collect())
            .collect())
    }
}

/// Whether `field` names the account, by name or numeric id.
fn matches_account(name: &str, id: &str, wanted: &str) -> bool {
    name == wanted || (wanted.parse::<u32>().is_ok() && id == wanted)
}

impl UserLookup for RootUsers {
    fn lookup(&self, name: &str) -> Result<Option<UserInfo>> {
        // name:password:uid:gid:gecos:home:shell
        for record in self.records("passwd")? {
            if record.len() < 4 || !matches_account(&record[0], &record[2], name) {
                continue;
            }
            let (Ok(uid), Ok(gid)) = (record[2].parse::<u32>(), record[3].parse::<u32>()) else {
                continue;
            };
            let home = record.get(5).filter(|h| !h.is_empty()).cloned();
            return Ok(Some(UserInfo {
                name: record[0].clone(),
                uid,
                gid,
                home,
            }));
        }
        Ok(None)
    }

    fn lookup_group(&self, name: &str) -> Result<Option<u32>> {
        // name:password:gid:members
        Ok(self
            .records("group")?
            .iter()
            .filter(|record| record.len() >= 3 && matches_account(&record[0], &record[2], name))
            .find_map(|record| record[2].parse::<u32>().ok()))
    }
}

/// Return `env` with a `HOME=` entry appended when none is present.
///
/// No user (or `root`) maps to `/root`. Otherwise the looked-up home
/// directory is used, falling back to `/home/<name>` when the account
/// records none, and to `/` when the account cannot be found.
pub fn add_default_home(user: Option<&str>, mut env: Vec<String>, users: &dyn UserLookup) -> Vec<String> {
    if env.iter().any(|e| e.starts_with("HOME=")) {
        return env;
    }

    let name = user
        .map(|u| u.split(':').next().unwrap_or(u))
        .filter(|u| !u.is_empty());

    let home = match name {
        None | Some("root") => DEFAULT_HOME.to_string(),
        Some(name) => match users.lookup(name) {
            Ok(Some(info)) => match info.home {
                Some(home) => home,
                None if info.name == "root" => DEFAULT_HOME.to_string(),
                None => format!("/home/{}", info.name),
            },
            Ok(None) => "/".to_string(),
            Err(e) => {
                tracing::debug!(user = name, error = %e, "User lookup failed, HOME defaults to /");
                "/".to_string()
            }
        },
    };

    env.push(format!("HOME={}", home));
    env
}

/// Resolve a `USER` value (`name`, `uid`, `name:group`, `uid:gid`) to ids.
pub fn resolve_ids(spec: &str, users: &dyn UserLookup) -> Result<(u32, u32)> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let (uid, primary_gid) = match users.lookup(user)? {
        Some(info) => (info.uid, info.gid),
        None => match user.parse::<u32>() {
            Ok(uid) => (uid, uid),
            Err(_) => return Err(BuildError::Config(format!("unknown user {}", user))),
        },
    };

    let gid = match group {
        None => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => users
                .lookup_group(group)?
                .ok_or_else(|| BuildError::Config(format!("unknown group {}", group)))?,
        },
    };

    Ok((uid, gid))
}
