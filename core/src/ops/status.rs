use std::collections::{BTreeMap, HashMap, HashSet};

use crate::clients::annex::WhereisRemote;
use crate::types::repo::FileStatus;

/// Everything the classifier needs, gathered up front by the drivers. The
/// decision logic itself is pure so both strategies can be exercised
/// without child processes.
#[derive(Debug, Default)]
pub struct ClassifierInput {
    pub cached: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
    pub deleted: Vec<String>,
    /// Content locations per annexed file.
    pub whereis: HashMap<String, Vec<WhereisRemote>>,
    /// Paths that differ from the upstream branch.
    pub upstream_diff: HashSet<String>,
    /// Large-file status flags (`?`, `A`, `M`, `D`, `T`) per path.
    pub annex_status: HashMap<String, String>,
}

/// Whereis-based seeding shared by both strategies: content everywhere
/// means synced, content only here means not yet uploaded, content nowhere
/// here means a placeholder.
fn seed_from_whereis(input: &ClassifierInput, statuses: &mut BTreeMap<String, FileStatus>) {
    for path in &input.cached {
        let Some(remotes) = input.whereis.get(path) else {
            continue;
        };
        let here = remotes.iter().any(|r| r.here);
        let status = if here && remotes.len() > 1 {
            FileStatus::Synced
        } else if here {
            FileStatus::LocalChanges
        } else {
            FileStatus::NoContent
        };
        statuses.insert(path.clone(), status);
    }
}

/// Classification for the normal (indirect) working-tree mode.
pub fn classify_indirect(input: &ClassifierInput) -> BTreeMap<String, FileStatus> {
    let mut statuses = BTreeMap::new();

    seed_from_whereis(input, &mut statuses);

    // anything differing from upstream is not yet uploaded, regardless of
    // where its content lives
    for path in &input.upstream_diff {
        if statuses.contains_key(path) || input.cached.contains(path) {
            statuses.insert(path.clone(), FileStatus::LocalChanges);
        }
    }

    for path in &input.cached {
        statuses.entry(path.clone()).or_insert(FileStatus::Synced);
    }

    for path in &input.modified {
        statuses.insert(path.clone(), FileStatus::Modified);
    }
    // unlocked placeholders show up as modified to the source-control tool;
    // the extension reports them as a type change
    for (path, flag) in &input.annex_status {
        if flag == "T" && input.modified.contains(path) {
            statuses.insert(path.clone(), FileStatus::Unlocked);
        }
    }

    for path in &input.untracked {
        statuses.insert(path.clone(), FileStatus::Untracked);
    }
    for path in &input.deleted {
        statuses.insert(path.clone(), FileStatus::Removed);
    }

    statuses
}

/// Classification for direct mode, where annexed files are real files and
/// the extension's own status output is authoritative for local changes.
/// Status `A` does not appear in direct mode.
pub fn classify_direct(input: &ClassifierInput) -> BTreeMap<String, FileStatus> {
    let mut statuses = BTreeMap::new();

    seed_from_whereis(input, &mut statuses);

    for (path, flag) in &input.annex_status {
        let status = match flag.as_str() {
            "?" => FileStatus::Untracked,
            "M" => FileStatus::Modified,
            "D" => FileStatus::Removed,
            _ => continue,
        };
        statuses.insert(path.clone(), status);
    }

    for path in &input.cached {
        statuses.entry(path.clone()).or_insert(FileStatus::Synced);
    }

    statuses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(here: bool) -> WhereisRemote {
        WhereisRemote {
            uuid: String::new(),
            description: String::new(),
            here,
        }
    }

    fn whereis_entry(path: &str, remotes: Vec<WhereisRemote>) -> (String, Vec<WhereisRemote>) {
        (path.to_string(), remotes)
    }

    /// The mixed working tree from the acceptance scenarios: synced,
    /// local-only, placeholder, untracked and deleted files together.
    #[test]
    fn mixed_tree_indirect() {
        let input = ClassifierInput {
            cached: vec!["a.txt".into(), "b.bin".into(), "c.dat".into()],
            modified: vec![],
            untracked: vec!["d.new".into()],
            deleted: vec!["e.gone".into()],
            whereis: [
                whereis_entry("a.txt", vec![remote(true), remote(false)]),
                whereis_entry("b.bin", vec![remote(true)]),
                whereis_entry("c.dat", vec![remote(false)]),
            ]
            .into_iter()
            .collect(),
            upstream_diff: HashSet::new(),
            annex_status: HashMap::new(),
        };

        let statuses = classify_indirect(&input);
        assert_eq!(statuses["a.txt"], FileStatus::Synced);
        assert_eq!(statuses["b.bin"], FileStatus::LocalChanges);
        assert_eq!(statuses["c.dat"], FileStatus::NoContent);
        assert_eq!(statuses["d.new"], FileStatus::Untracked);
        assert_eq!(statuses["e.gone"], FileStatus::Removed);
        assert_eq!(statuses.len(), 5);
    }

    #[test]
    fn upstream_diff_overrides_whereis() {
        let input = ClassifierInput {
            cached: vec!["a.txt".into()],
            whereis: [whereis_entry("a.txt", vec![remote(true), remote(false)])]
                .into_iter()
                .collect(),
            upstream_diff: ["a.txt".to_string()].into_iter().collect(),
            ..Default::default()
        };

        let statuses = classify_indirect(&input);
        assert_eq!(statuses["a.txt"], FileStatus::LocalChanges);
    }

    #[test]
    fn cached_without_whereis_is_synced() {
        let input = ClassifierInput {
            cached: vec!["small.txt".into()],
            ..Default::default()
        };
        assert_eq!(
            classify_indirect(&input)["small.txt"],
            FileStatus::Synced
        );
    }

    #[test]
    fn unlocked_files_override_modified() {
        let input = ClassifierInput {
            cached: vec!["big.nc".into(), "notes.txt".into()],
            modified: vec!["big.nc".into(), "notes.txt".into()],
            annex_status: [("big.nc".to_string(), "T".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        let statuses = classify_indirect(&input);
        assert_eq!(statuses["big.nc"], FileStatus::Unlocked);
        assert_eq!(statuses["notes.txt"], FileStatus::Modified);
    }

    #[test]
    fn every_path_gets_exactly_one_status() {
        let input = ClassifierInput {
            cached: vec!["a".into(), "b".into()],
            modified: vec!["a".into()],
            untracked: vec!["c".into()],
            deleted: vec!["d".into()],
            ..Default::default()
        };

        let statuses = classify_indirect(&input);
        let all: HashSet<&str> = ["a", "b", "c", "d"].into_iter().collect();
        assert_eq!(
            statuses.keys().map(|s| s.as_str()).collect::<HashSet<_>>(),
            all
        );
    }

    #[test]
    fn direct_mode_uses_extension_status() {
        let input = ClassifierInput {
            cached: vec!["tracked.nc".into(), "edited.nc".into()],
            whereis: [whereis_entry(
                "tracked.nc",
                vec![remote(true), remote(false)],
            )]
            .into_iter()
            .collect(),
            annex_status: [
                ("edited.nc".to_string(), "M".to_string()),
                ("stray.tmp".to_string(), "?".to_string()),
                ("gone.nc".to_string(), "D".to_string()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };

        let statuses = classify_direct(&input);
        assert_eq!(statuses["tracked.nc"], FileStatus::Synced);
        assert_eq!(statuses["edited.nc"], FileStatus::Modified);
        assert_eq!(statuses["stray.tmp"], FileStatus::Untracked);
        assert_eq!(statuses["gone.nc"], FileStatus::Removed);
    }
}
