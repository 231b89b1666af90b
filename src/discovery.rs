use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use walkdir::WalkDir;

use crate::model::WorkItem;

const SEASON_DIR_PREFIX: &str = "season_";

// 44.1kHz 16-bit stereo PCM
const WAV_BYTES_PER_MINUTE: f64 = 10.5 * 1024.0 * 1024.0;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("audio directory '{}' does not exist", .0.display())]
    RootMissing(PathBuf),
    #[error("walk audio directory")]
    Walk(#[from] walkdir::Error),
}

/// Finds every `season_*/SxxEyy.<ext>` file under `root`, ordered by season
/// directory then file name.
pub fn discover(root: &Path, extensions: &[String]) -> Result<Vec<WorkItem>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::RootMissing(root.to_path_buf()));
    }

    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1
                || (e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|n| n.starts_with(SEASON_DIR_PREFIX)))
        });
    for entry in walker {
        let entry = entry?;
        if entry.depth() != 2 || !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((season, episode)) = parse_episode_token(stem) else {
            tracing::debug!(path = %path.display(), "no SxxEyy token, ignoring");
            continue;
        };
        let id = format!("S{season}E{episode}");
        if !seen.insert(id.clone()) {
            tracing::warn!(episode = %id, path = %path.display(), "duplicate episode, ignoring");
            continue;
        }
        items.push(WorkItem {
            id,
            season: season.to_string(),
            episode: episode.to_string(),
            source_path: path.to_path_buf(),
        });
    }
    Ok(items)
}

/// Parses a leading `S<digits>E<digits>` token, e.g. `S01E02` into
/// (`"01"`, `"02"`).
pub fn parse_episode_token(stem: &str) -> Option<(&str, &str)> {
    let rest = stem.strip_prefix(['S', 's'])?;
    let season_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let (season, rest) = rest.split_at(season_len);
    let rest = rest.strip_prefix(['E', 'e'])?;
    let episode_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let episode = &rest[..episode_len];
    if season.is_empty() || episode.is_empty() {
        return None;
    }
    Some((season, episode))
}

/// Length of an audio file, probed from its container when possible and
/// otherwise estimated from its size.
pub fn audio_length(path: &Path) -> Option<Duration> {
    probe_length(path).or_else(|| {
        let size = std::fs::metadata(path).ok()?.len();
        Some(Duration::from_secs_f64(
            size as f64 / WAV_BYTES_PER_MINUTE * 60.0,
        ))
    })
}

fn probe_length(path: &Path) -> Option<Duration> {
    let src = std::fs::File::open(path).ok()?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?;
    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.n_frames.is_some())?;
    let (Some(time_base), Some(n_frames)) =
        (track.codec_params.time_base, track.codec_params.n_frames)
    else {
        return None;
    };
    let length = time_base.calc_time(n_frames);
    Some(Duration::from_secs(length.seconds) + Duration::from_secs_f64(length.frac))
}
