//! Roster store: atomic on-disk persistence of the known-peers roster.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::metadata::RosterEntry;

/// `<expanded_data_dir>/rqlite/raft/peers.json`, the file the database reads
/// on boot to recover its voting membership.
fn raft_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("rqlite").join("raft")
}

/// Resolve the configured data directory against the process home directory
/// and `${VAR}` environment references, mirroring the shell's own tilde and
/// variable expansion.
#[must_use]
pub fn expand_data_dir(data_dir: &Path) -> PathBuf {
    let raw = data_dir.to_string_lossy();

    let tilde_expanded = if let Some(rest) = raw.strip_prefix('~') {
        match dirs::home_dir() {
            Some(home) => format!("{}{}", home.to_string_lossy(), rest),
            None => raw.into_owned(),
        }
    } else {
        raw.into_owned()
    };

    let env_expanded = shellexpand::env(&tilde_expanded)
        .map(|cow| cow.into_owned())
        .unwrap_or(tilde_expanded);

    PathBuf::from(env_expanded)
}

/// Atomically persist `entries` as `peers.json` under `data_dir`'s resolved
/// `rqlite/raft` subdirectory (§4.B).
///
/// Steps 1, 3, 4, 5 of the write protocol are fatal and reported to the
/// caller as [`BridgeError::RosterWrite`]; step 2 (backing up the previous
/// file) is best-effort and never fails the call.
pub fn write_roster(data_dir: &Path, entries: &[RosterEntry]) -> BridgeResult<()> {
    let resolved = expand_data_dir(data_dir);
    let dir = raft_dir(&resolved);
    let peer_count = entries.len();

    let to_write_error = |source: std::io::Error| BridgeError::RosterWrite {
        data_dir: dir.clone(),
        peer_count,
        source,
    };

    std::fs::create_dir_all(&dir).map_err(to_write_error)?;
    set_dir_permissions(&dir).map_err(to_write_error)?;

    let final_path = dir.join("peers.json");
    let backup_path = dir.join("peers.json.backup");
    let tmp_path = dir.join("peers.json.tmp");

    if final_path.exists() {
        if let Err(err) = std::fs::copy(&final_path, &backup_path) {
            warn!(path = %backup_path.display(), error = %err, "failed to back up previous roster file, continuing");
        }
    }

    let bytes = serde_json::to_vec_pretty(entries).map_err(BridgeError::from)?;

    std::fs::write(&tmp_path, &bytes).map_err(to_write_error)?;
    set_file_permissions(&tmp_path).map_err(to_write_error)?;
    std::fs::rename(&tmp_path, &final_path).map_err(to_write_error)?;

    debug!(path = %final_path.display(), peer_count, "wrote roster file");
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_dir_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Read back `peers.json` under `data_dir`, if it exists.
pub fn read_roster(data_dir: &Path) -> BridgeResult<Option<Vec<RosterEntry>>> {
    let resolved = expand_data_dir(data_dir);
    let path = raft_dir(&resolved).join("peers.json");
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str) -> RosterEntry {
        RosterEntry {
            id: addr.to_string(),
            address: addr.to_string(),
            non_voter: false,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = vec![entry("10.0.0.1:4002"), entry("10.0.0.2:4002")];

        write_roster(tmp.path(), &entries).unwrap();
        let read_back = read_roster(tmp.path()).unwrap().unwrap();

        assert_eq!(read_back, entries);
    }

    #[test]
    fn second_write_creates_a_backup_of_the_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_roster(tmp.path(), &[entry("10.0.0.1:4002")]).unwrap();
        write_roster(tmp.path(), &[entry("10.0.0.1:4002"), entry("10.0.0.2:4002")]).unwrap();

        let backup_path = raft_dir(tmp.path()).join("peers.json.backup");
        let backup: Vec<RosterEntry> =
            serde_json::from_slice(&std::fs::read(backup_path).unwrap()).unwrap();
        assert_eq!(backup, vec![entry("10.0.0.1:4002")]);
    }

    #[test]
    fn expand_data_dir_resolves_leading_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let expanded = expand_data_dir(Path::new("~/raftmesh"));
        assert_eq!(expanded, home.join("raftmesh"));
    }

    #[test]
    fn expand_data_dir_substitutes_env_vars() {
        std::env::set_var("RAFTMESH_TEST_EXPAND_VAR", "/tmp/raftmesh-test");
        let expanded = expand_data_dir(Path::new("${RAFTMESH_TEST_EXPAND_VAR}/data"));
        std::env::remove_var("RAFTMESH_TEST_EXPAND_VAR");
        assert_eq!(expanded, PathBuf::from("/tmp/raftmesh-test/data"));
    }

    #[test]
    fn missing_roster_reads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_roster(tmp.path()).unwrap(), None);
    }

    #[test]
    fn tmp_file_is_removed_after_a_successful_write() {
        let tmp = tempfile::tempdir().unwrap();
        write_roster(tmp.path(), &[entry("10.0.0.1:4002")]).unwrap();
        assert!(!raft_dir(tmp.path()).join("peers.json.tmp").exists());
    }
}
