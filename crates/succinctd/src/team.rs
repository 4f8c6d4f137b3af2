//! The team this node belongs to.
//!
//! Each team's records live under `{storage}/{team_id}/`; the id of the
//! team currently held is kept in `{storage}/current_team`. A node holds at
//! most one team.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use succinct_core::team::now_millis;
use succinct_core::{PeerId, Team, TeamMember};
use succinct_services::store::RecordStore;
use succinct_services::{FileStore, StoreError};

const CURRENT_TEAM_FILE: &str = "current_team";

#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("already in team {0}")]
    AlreadyInTeam(PeerId),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed team file {0}")]
    Malformed(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn team_dir(root: &Path, team: &PeerId) -> PathBuf {
    root.join(team.to_string())
}

pub fn current_team(root: &Path) -> Result<Option<PeerId>, TeamError> {
    let path = root.join(CURRENT_TEAM_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(TeamError::Io { path, source }),
    };
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| TeamError::Malformed(path))
}

pub fn open_store(root: &Path, team: PeerId) -> Result<Arc<dyn RecordStore>, StoreError> {
    let store: Arc<dyn RecordStore> = Arc::new(FileStore::open(team_dir(root, &team), team)?);
    Ok(store)
}

fn hold(root: &Path, team: PeerId) -> Result<(), TeamError> {
    if let Some(current) = current_team(root)? {
        return Err(TeamError::AlreadyInTeam(current));
    }
    let path = root.join(CURRENT_TEAM_FILE);
    std::fs::create_dir_all(root).map_err(|source| TeamError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    std::fs::write(&path, team.to_string()).map_err(|source| TeamError::Io { path, source })
}

/// Start a new team led by `me`.
pub fn create_team(
    root: &Path,
    me: PeerId,
    name: &str,
    member: TeamMember,
) -> Result<Team, TeamError> {
    if let Some(current) = current_team(root)? {
        return Err(TeamError::AlreadyInTeam(current));
    }
    let id = PeerId::generate();
    let team = Team {
        epoch: now_millis(),
        id: Some(id),
        leader: me,
        name: name.to_owned(),
    };
    let store = open_store(root, id)?;
    store.append_record(id, &team)?;
    store.append_record(me, &member)?;
    hold(root, id)?;
    tracing::info!(team = %id, name, "team created");
    Ok(team)
}

/// Join an existing team. Its records arrive from the leader; only our own
/// identity is written here.
pub fn join_team(
    root: &Path,
    me: PeerId,
    team: PeerId,
    member: TeamMember,
) -> Result<(), TeamError> {
    hold(root, team)?;
    let store = open_store(root, team)?;
    store.append_record(me, &member)?;
    tracing::info!(team = %team, "team joined");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "succinctd-{}-test-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn member() -> TeamMember {
        TeamMember {
            employee_id: "e1".into(),
            name: "alice".into(),
        }
    }

    #[test]
    fn create_records_the_team_and_its_leader() {
        let root = temp_root("create");
        let me = PeerId::from_bytes([1; 4]);
        let team = create_team(&root, me, "crew", member()).unwrap();
        let id = team.id.unwrap();
        assert_eq!(current_team(&root).unwrap(), Some(id));

        let store = open_store(&root, id).unwrap();
        assert_eq!(store.last_record::<Team>(id).unwrap(), Some(team));
        assert_eq!(store.last_record::<TeamMember>(me).unwrap(), Some(member()));
    }

    #[test]
    fn joining_while_in_a_team_fails() {
        let root = temp_root("join");
        let me = PeerId::from_bytes([1; 4]);
        let first = PeerId::from_bytes([0xaa; 4]);
        join_team(&root, me, first, member()).unwrap();

        let err = join_team(&root, me, PeerId::from_bytes([0xbb; 4]), member()).unwrap_err();
        assert!(matches!(err, TeamError::AlreadyInTeam(id) if id == first));
        assert!(matches!(
            create_team(&root, me, "other", member()),
            Err(TeamError::AlreadyInTeam(_))
        ));
    }
}
