//! Conflict detection and resolution, and the atomic write primitive used
//! by both the resolver and the delta-apply step.

use crate::error::{resolve_empty_remote, resolve_local_missing, resolve_write_failed, CoreError};
use crate::sync::vclock::VectorClock;
use crate::types::now_secs;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    NewestWins,
    LargestWins,
    RemoteWins,
    LocalWins,
    KeepBoth,
    Manual,
}

#[derive(Debug, Clone)]
pub struct FileConflict {
    pub path: PathBuf,
    pub local_timestamp: u64,
    pub remote_timestamp: u64,
    pub local_size: u64,
    pub remote_size: u64,
    pub remote_peer_id: String,
    pub strategy: ResolutionStrategy,
}

/// Equal hashes: no conflict. Causal order either way: no conflict, the
/// stale side simply loses. Concurrent: conflict.
pub fn detect(
    local_hash: &str,
    remote_hash: &str,
    local_vc: &VectorClock,
    remote_vc: &VectorClock,
) -> bool {
    if local_hash == remote_hash {
        return false;
    }
    if remote_vc.happens_before(local_vc) || local_vc.happens_before(remote_vc) {
        return false;
    }
    remote_vc.concurrent(local_vc)
}

/// Write `data` to `path` via temp-file + fsync + rename. Parent
/// directories are created if absent; the temp file is unlinked on any
/// failure so the target is never observed half-written.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<(), CoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.as_os_str().is_empty() && !dir.exists() {
        fs::create_dir_all(dir)?;
    }

    let filename = path
        .file_name()
        .ok_or_else(|| resolve_write_failed("target path has no filename"))?
        .to_string_lossy();
    let suffix: u32 = rand::random();
    let temp_path = dir.join(format!(".{filename}.{suffix}.tmp"));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(resolve_write_failed(e.to_string()));
    }
    Ok(())
}

fn generate_conflict_path(original: &Path, suffix: &str) -> PathBuf {
    let stem = original.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = original.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    let name = format!("{stem}.conflict.{suffix}{ext}");
    match original.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(name),
        _ => PathBuf::from(name),
    }
}

fn apply_newest_wins(conflict: &FileConflict, local_path: &Path, remote_data: &[u8]) -> Result<(), CoreError> {
    if conflict.remote_timestamp > conflict.local_timestamp {
        if remote_data.is_empty() {
            return Err(resolve_empty_remote("remote data empty for NewestWins"));
        }
        write_file_atomic(local_path, remote_data)
    } else {
        Ok(())
    }
}

fn apply_largest_wins(conflict: &FileConflict, local_path: &Path, remote_data: &[u8]) -> Result<(), CoreError> {
    if conflict.remote_size > conflict.local_size {
        if remote_data.is_empty() {
            return Err(resolve_empty_remote("remote data empty for LargestWins"));
        }
        write_file_atomic(local_path, remote_data)
    } else {
        Ok(())
    }
}

fn apply_keep_both(conflict: &FileConflict, local_path: &Path, remote_data: &[u8]) -> Result<(), CoreError> {
    let timestamp = now_secs();

    if local_path.exists() {
        let local_conflict_path = generate_conflict_path(local_path, &format!("local_{timestamp}"));
        fs::copy(local_path, &local_conflict_path)?;
    }

    let remote_conflict_path = generate_conflict_path(
        local_path,
        &format!("remote_{}_{timestamp}", conflict.remote_peer_id),
    );
    write_file_atomic(&remote_conflict_path, remote_data)?;
    Ok(())
}

/// Dispatch resolution by strategy. Never mutates `local_path` except under
/// `NewestWins`/`LargestWins`/`RemoteWins` when the remote side wins, and
/// always via [`write_file_atomic`].
pub fn resolve(conflict: &FileConflict, local_path: &Path, remote_data: &[u8]) -> Result<(), CoreError> {
    let local_exists = local_path.exists();
    if !local_exists && conflict.strategy == ResolutionStrategy::LocalWins {
        return Err(resolve_local_missing("local file missing, cannot apply LocalWins"));
    }

    match conflict.strategy {
        ResolutionStrategy::NewestWins => apply_newest_wins(conflict, local_path, remote_data),
        ResolutionStrategy::LargestWins => apply_largest_wins(conflict, local_path, remote_data),
        ResolutionStrategy::RemoteWins => {
            if remote_data.is_empty() {
                return Err(resolve_empty_remote("remote data empty for RemoteWins"));
            }
            write_file_atomic(local_path, remote_data)
        }
        ResolutionStrategy::LocalWins => Ok(()),
        ResolutionStrategy::KeepBoth | ResolutionStrategy::Manual => apply_keep_both(conflict, local_path, remote_data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vc(pairs: &[(&str, u64)]) -> VectorClock {
        let mut vc = VectorClock::new();
        for &(peer, count) in pairs {
            for _ in 0..count {
                vc.increment(peer);
            }
        }
        vc
    }

    #[test]
    fn equal_hashes_never_conflict() {
        assert!(!detect("h", "h", &vc(&[("a", 1)]), &vc(&[("b", 1)])));
    }

    #[test]
    fn causally_ordered_never_conflicts() {
        let local = vc(&[("a", 1)]);
        let mut remote = local.clone();
        remote.increment("a");
        assert!(!detect("h1", "h2", &local, &remote));
    }

    #[test]
    fn concurrent_is_a_conflict() {
        let local = vc(&[("a", 1)]);
        let remote = vc(&[("b", 1)]);
        assert!(detect("h1", "h2", &local, &remote));
    }

    #[test]
    fn atomic_write_roundtrip() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.txt");
        write_file_atomic(&target, b"hello").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");
        // no leftover temp files
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn keep_both_leaves_target_untouched_and_writes_siblings() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("doc.txt");
        fs::write(&target, b"aaa").unwrap();

        let conflict = FileConflict {
            path: target.clone(),
            local_timestamp: 1,
            remote_timestamp: 2,
            local_size: 3,
            remote_size: 3,
            remote_peer_id: "peer-b".to_string(),
            strategy: ResolutionStrategy::KeepBoth,
        };
        resolve(&conflict, &target, b"bbb").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"aaa");
        let siblings: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(siblings.iter().any(|n| n.contains("conflict.local_")));
        assert!(siblings.iter().any(|n| n.contains("conflict.remote_peer-b_")));
    }

    #[test]
    fn newest_wins_keeps_local_when_newer() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.txt");
        fs::write(&target, b"local").unwrap();
        let conflict = FileConflict {
            path: target.clone(),
            local_timestamp: 100,
            remote_timestamp: 50,
            local_size: 5,
            remote_size: 6,
            remote_peer_id: "peer-b".to_string(),
            strategy: ResolutionStrategy::NewestWins,
        };
        resolve(&conflict, &target, b"remote").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"local");
    }
}
