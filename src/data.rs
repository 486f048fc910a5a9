//! # Evaluation Data
//!
//! LibriSpeech-style corpus loading and seeded sampling.
//!
//! ## Directory Layout:
//! ```text
//! <root>/<speaker>/<chapter>/<speaker>-<chapter>.trans.txt
//! <root>/<speaker>/<chapter>/<utterance-id>.flac
//! ```
//! Each transcript line is `<utterance-id> <REFERENCE TEXT>`.

use crate::audio::load_audio;
use crate::error::{HarnessError, HarnessResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Audio extensions tried for each utterance id, in order.
const AUDIO_EXTENSIONS: [&str; 2] = ["flac", "wav"];

/// One transcript line, before its audio is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub audio_path: PathBuf,
    pub reference: String,
}

impl TranscriptEntry {
    pub fn load(&self) -> HarnessResult<Utterance> {
        Ok(Utterance {
            id: self.id.clone(),
            audio: load_audio(&self.audio_path)?,
            reference: self.reference.clone(),
        })
    }
}

/// A decoded utterance with its reference transcript.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: String,
    pub audio: Vec<f32>,
    pub reference: String,
}

fn sorted_dirs(dir: &Path) -> HarnessResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn resolve_audio(chapter_dir: &Path, id: &str) -> HarnessResult<PathBuf> {
    AUDIO_EXTENSIONS
        .iter()
        .map(|ext| chapter_dir.join(format!("{}.{}", id, ext)))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            HarnessError::Data(format!(
                "No audio file for utterance {} in {}",
                id,
                chapter_dir.display()
            ))
        })
}

/// Parse one transcript file.
fn parse_transcript(path: &Path, chapter_dir: &Path) -> HarnessResult<Vec<TranscriptEntry>> {
    let contents = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, reference) = line.split_once(' ').unwrap_or((line, ""));
        entries.push(TranscriptEntry {
            id: id.to_string(),
            audio_path: resolve_audio(chapter_dir, id)?,
            reference: reference.trim().to_string(),
        });
    }
    Ok(entries)
}

/// List every utterance under `root` without decoding audio.
///
/// Speakers, chapters and transcript files are visited in sorted order;
/// lines keep their file order.
pub fn read_transcripts(root: &Path) -> HarnessResult<Vec<TranscriptEntry>> {
    if !root.is_dir() {
        return Err(HarnessError::Data(format!("Corpus root {} is not a directory", root.display())));
    }

    let mut entries = Vec::new();
    for speaker in sorted_dirs(root)? {
        for chapter in sorted_dirs(&speaker)? {
            let mut transcripts: Vec<PathBuf> = fs::read_dir(&chapter)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().map_or(false, |ext| ext == "txt"))
                .collect();
            transcripts.sort();
            for transcript in transcripts {
                let parsed = parse_transcript(&transcript, &chapter)?;
                debug!("{}: {} utterances", transcript.display(), parsed.len());
                entries.extend(parsed);
            }
        }
    }
    info!("Found {} utterances under {}", entries.len(), root.display());
    Ok(entries)
}

/// Decode the given entries.
pub fn load_entries(entries: &[TranscriptEntry]) -> HarnessResult<Vec<Utterance>> {
    entries.iter().map(TranscriptEntry::load).collect()
}

/// Load every utterance under `root`, audio included.
pub fn load_librispeech(root: &Path) -> HarnessResult<Vec<Utterance>> {
    load_entries(&read_transcripts(root)?)
}

/// Draw `n` items uniformly with replacement, reproducibly for a given seed.
pub fn random_choice<T: Clone>(items: &[T], n: usize, seed: u64) -> HarnessResult<Vec<T>> {
    if items.is_empty() && n > 0 {
        return Err(HarnessError::Data("Cannot sample from an empty collection".to_string()));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..n).map(|_| items[rng.gen_range(0..items.len())].clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn write_wav(path: &Path, samples: Vec<i16>) {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, 16_000, 16);
        let mut cursor = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor).unwrap();
        fs::write(path, cursor.into_inner()).unwrap();
    }

    fn corpus() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (speaker, chapter, lines) in [
            ("84", "121123", vec![("84-121123-0000", "GO DO YOU HEAR"), ("84-121123-0001", "BUT IN LESS")]),
            ("1272", "128104", vec![("1272-128104-0000", "MISTER QUILTER")]),
        ] {
            let chapter_dir = dir.path().join(speaker).join(chapter);
            fs::create_dir_all(&chapter_dir).unwrap();
            let mut transcript = String::new();
            for (id, text) in &lines {
                transcript.push_str(&format!("{} {}\n", id, text));
                write_wav(&chapter_dir.join(format!("{}.wav", id)), vec![0, 1000, -1000, 0]);
            }
            fs::write(chapter_dir.join(format!("{}-{}.trans.txt", speaker, chapter)), transcript).unwrap();
        }
        dir
    }

    #[test]
    fn test_read_transcripts_in_sorted_order() {
        let dir = corpus();
        let entries = read_transcripts(dir.path()).unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        // "1272" sorts before "84" lexicographically
        assert_eq!(ids, vec!["1272-128104-0000", "84-121123-0000", "84-121123-0001"]);
        assert_eq!(entries[1].reference, "GO DO YOU HEAR");
    }

    #[test]
    fn test_load_decodes_audio() {
        let dir = corpus();
        let utterances = load_librispeech(dir.path()).unwrap();
        assert_eq!(utterances.len(), 3);
        assert_eq!(utterances[0].audio.len(), 4);
        assert_eq!(utterances[0].reference, "MISTER QUILTER");
    }

    #[test]
    fn test_missing_audio_is_an_error() {
        let dir = corpus();
        fs::remove_file(dir.path().join("84/121123/84-121123-0001.wav")).unwrap();
        let err = read_transcripts(dir.path()).unwrap_err();
        assert!(err.to_string().contains("84-121123-0001"));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        assert!(read_transcripts(Path::new("/nonexistent/librispeech")).is_err());
    }

    #[test]
    fn test_random_choice_is_seeded() {
        let items: Vec<u32> = (0..50).collect();
        let a = random_choice(&items, 10, 1337).unwrap();
        let b = random_choice(&items, 10, 1337).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.iter().all(|x| *x < 50));

        // With replacement: more draws than items is fine
        assert_eq!(random_choice(&items[..2], 5, 7).unwrap().len(), 5);
        assert!(random_choice::<u32>(&[], 1, 7).is_err());
        assert!(random_choice::<u32>(&[], 0, 7).unwrap().is_empty());
    }
}
