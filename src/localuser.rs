//! Local account resolution: the mapped policy username must correspond to
//! a real system account before a session can run as it.

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use nix::unistd::{Uid, User};

/// A resolved local account: everything a session needs to spawn a child
/// process as that user.
#[derive(Debug, Clone)]
pub struct LocalAccount {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// Supplementary group IDs, primary group included.
    pub group_ids: Vec<u32>,
}

impl LocalAccount {
    /// Look up `name` in the system user database.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .with_context(|| format!("looking up local user {name:?}"))?
            .ok_or_else(|| anyhow!("local user {name:?} does not exist"))?;

        let cname = CString::new(name).context("local username contains NUL")?;
        let group_ids = match nix::unistd::getgrouplist(&cname, user.gid) {
            Ok(groups) => groups.iter().map(|g| g.as_raw()).collect(),
            // A user with an unreadable group database still has a primary group.
            Err(_) => vec![user.gid.as_raw()],
        };

        let shell = if user.shell.as_os_str().is_empty() {
            PathBuf::from("/bin/sh")
        } else {
            user.shell
        };

        Ok(Self {
            username: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
            shell,
            group_ids,
        })
    }
}

/// The effective uid of this process. Sessions may only switch users when
/// running as root; otherwise the target account must equal this uid.
pub fn process_euid() -> u32 {
    Uid::effective().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_root_exists() {
        let acct = LocalAccount::lookup("root").unwrap();
        assert_eq!(acct.uid, 0);
        assert_eq!(acct.username, "root");
        assert!(!acct.group_ids.is_empty());
        assert!(acct.shell.is_absolute());
    }

    #[test]
    fn lookup_missing_user_fails() {
        assert!(LocalAccount::lookup("no-such-user-meshssh").is_err());
    }
}
