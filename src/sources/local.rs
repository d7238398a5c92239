//! The on-disk audio library: user music plus the effect folders.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a"];

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// All audio file names in `dir`, sorted for stable listings. A missing
/// directory is an empty library, not an error.
pub fn list_tracks(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| is_audio_file(path))
        .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names
}

/// Finds a library track by exact file name first, then by case-insensitive
/// substring.
pub fn find_track(dir: &Path, query: &str) -> Option<PathBuf> {
    let names = list_tracks(dir);
    if names.iter().any(|name| name == query) {
        return Some(dir.join(query));
    }

    let query_lower = query.to_lowercase();
    names
        .iter()
        .find(|name| name.to_lowercase().contains(&query_lower))
        .map(|name| dir.join(name))
}

/// Picks one audio file at random, for the effect folders.
pub fn random_track(dir: &Path, rng: &mut impl rand::Rng) -> Option<PathBuf> {
    let names = list_tracks(dir);
    names.choose(rng).map(|name| dir.join(name))
}

/// Which folders the automatic prank draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrankMode {
    #[default]
    Normal,
    Jimmy,
    Mixed,
}

impl std::str::FromStr for PrankMode {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "jimmy" => Ok(Self::Jimmy),
            "mixed" => Ok(Self::Mixed),
            _ => Err(()),
        }
    }
}

/// Draws one prank file from the folder(s) the mode selects. Empty folders
/// simply shrink the candidate pool.
pub fn select_prank_file(
    mode: PrankMode,
    sounds_dir: &Path,
    jimmy_dir: &Path,
    rng: &mut impl rand::Rng,
) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if matches!(mode, PrankMode::Normal | PrankMode::Mixed) {
        candidates.extend(list_tracks(sounds_dir).into_iter().map(|name| sounds_dir.join(name)));
    }
    if matches!(mode, PrankMode::Jimmy | PrankMode::Mixed) {
        candidates.extend(list_tracks(jimmy_dir).into_iter().map(|name| jimmy_dir.join(name)));
    }
    candidates.choose(rng).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn library(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        for name in files {
            std::fs::write(dir.path().join(name), b"").expect("touch file");
        }
        dir
    }

    #[test]
    fn lists_only_audio_files_sorted() {
        let dir = library(&["b.mp3", "a.wav", "notes.txt", "c.M4A"]);
        assert_eq!(list_tracks(dir.path()), vec!["a.wav", "b.mp3", "c.M4A"]);
    }

    #[test]
    fn missing_directory_is_an_empty_library() {
        assert!(list_tracks(Path::new("/nonexistent/library")).is_empty());
        assert!(find_track(Path::new("/nonexistent/library"), "x").is_none());
    }

    #[test]
    fn exact_name_wins_over_substring() {
        let dir = library(&["song.mp3", "song.mp3.wav"]);
        let found = find_track(dir.path(), "song.mp3").expect("match");
        assert_eq!(found, dir.path().join("song.mp3"));
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let dir = library(&["Never Gonna.mp3"]);
        let found = find_track(dir.path(), "never").expect("match");
        assert_eq!(found, dir.path().join("Never Gonna.mp3"));
        assert!(find_track(dir.path(), "rick").is_none());
    }

    #[test]
    fn random_track_draws_from_the_library() {
        let dir = library(&["a.mp3", "b.mp3"]);
        let mut rng = StdRng::seed_from_u64(1);
        let picked = random_track(dir.path(), &mut rng).expect("non-empty library");
        assert!(picked.starts_with(dir.path()));
        assert!(random_track(Path::new("/nonexistent"), &mut rng).is_none());
    }

    #[test]
    fn prank_selection_respects_the_mode() {
        let sounds = library(&["boo.mp3"]);
        let jimmy = library(&["jimmy.mp3"]);
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..10 {
            let normal = select_prank_file(PrankMode::Normal, sounds.path(), jimmy.path(), &mut rng)
                .expect("sounds folder has a file");
            assert!(normal.starts_with(sounds.path()));

            let jimmy_pick =
                select_prank_file(PrankMode::Jimmy, sounds.path(), jimmy.path(), &mut rng)
                    .expect("jimmy folder has a file");
            assert!(jimmy_pick.starts_with(jimmy.path()));
        }

        let mixed = select_prank_file(PrankMode::Mixed, sounds.path(), jimmy.path(), &mut rng);
        assert!(mixed.is_some());
        assert!(
            select_prank_file(PrankMode::Jimmy, sounds.path(), Path::new("/nonexistent"), &mut rng)
                .is_none()
        );
    }

    #[test]
    fn prank_mode_parses_case_insensitively() {
        assert_eq!("Jimmy".parse::<PrankMode>(), Ok(PrankMode::Jimmy));
        assert_eq!("MIXED".parse::<PrankMode>(), Ok(PrankMode::Mixed));
        assert_eq!("normal".parse::<PrankMode>(), Ok(PrankMode::Normal));
        assert!("loud".parse::<PrankMode>().is_err());
    }
}
