//! Audio file decoding to mono f32 at the model sample rate.
//!
//! WAV goes through the `wav` crate, FLAC (and anything else symphonia can
//! probe) through `symphonia`.

use super::processor::{AudioFormat, AudioProcessor};
use super::SAMPLE_RATE;
use crate::error::{HarnessError, HarnessResult};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Decode an audio file, picking the decoder from its extension.
pub fn load_audio(path: &Path) -> HarnessResult<Vec<f32>> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let processor = AudioProcessor::new(SAMPLE_RATE);
    let samples = match extension.as_str() {
        "wav" => decode_wav(path, &processor)?,
        _ => decode_with_symphonia(path, &extension, &processor)?,
    };
    if samples.is_empty() {
        return Err(HarnessError::Data(format!("No audio samples decoded from {}", path.display())));
    }
    debug!("Decoded {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

fn decode_wav(path: &Path, processor: &AudioProcessor) -> HarnessResult<Vec<f32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let (header, data) = wav::read(&mut reader)?;
    let format = AudioFormat {
        sample_rate: header.sampling_rate,
        channels: header.channel_count,
        bits_per_sample: header.bits_per_sample,
    };
    processor.validate_format(&format)?;

    let interleaved = match data {
        wav::BitDepth::Eight(samples) => processor.pcm8_to_float(&samples),
        wav::BitDepth::Sixteen(samples) => processor.pcm16_to_float(&samples),
        wav::BitDepth::TwentyFour(samples) => processor.pcm24_to_float(&samples),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };
    Ok(processor.downmix(&interleaved, format.channels as usize))
}

fn decode_with_symphonia(path: &Path, extension: &str, processor: &AudioProcessor) -> HarnessResult<Vec<f32>> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if !extension.is_empty() {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| HarnessError::Data(format!("No audio track in {}", path.display())))?;
    let codec_params = track.codec_params.clone();
    let track_id = track.id;

    let channels = codec_params.channels.map_or(1, |c| c.count());
    processor.validate_format(&AudioFormat {
        sample_rate: codec_params.sample_rate.unwrap_or(0),
        channels: channels as u16,
        bits_per_sample: codec_params.bits_per_sample.unwrap_or(0) as u16,
    })?;

    let mut decoder = symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;
    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend(processor.downmix(buffer.samples(), channels));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn write_wav(dir: &TempDir, name: &str, rate: u32, channels: u16, samples: Vec<i16>) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, channels, rate, 16);
        let mut cursor = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor).unwrap();
        std::fs::write(&path, cursor.into_inner()).unwrap();
        path
    }

    #[test]
    fn test_decode_mono_wav() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "a.wav", 16_000, 1, vec![0, 16384, -16384, 8192]);
        let samples = load_audio(&path).unwrap();
        assert_eq!(samples, vec![0.0, 0.5, -0.5, 0.25]);
    }

    #[test]
    fn test_decode_stereo_wav_downmixes() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "stereo.WAV", 16_000, 2, vec![16384, 0, -16384, -16384]);
        let samples = load_audio(&path).unwrap();
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_wrong_sample_rate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_wav(&dir, "fast.wav", 8_000, 1, vec![0; 16]);
        let err = load_audio(&path).unwrap_err();
        assert!(err.to_string().contains("Sample rate mismatch"));
    }

    #[test]
    fn test_symphonia_decodes_wav_fixture() {
        let dir = TempDir::new().unwrap();
        let pcm: Vec<i16> = (0..1600).map(|i| ((i as f32 * 0.05).sin() * 12_000.0) as i16).collect();
        let path = write_wav(&dir, "tone.wav", 16_000, 1, pcm.clone());
        let processor = AudioProcessor::new(SAMPLE_RATE);

        let samples = decode_with_symphonia(&path, "wav", &processor).unwrap();
        assert_eq!(samples.len(), pcm.len());
        let expected = decode_wav(&path, &processor).unwrap();
        for (got, want) in samples.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4, "{} vs {}", got, want);
        }

        let stereo = write_wav(&dir, "stereo.wav", 16_000, 2, vec![16384, 0, -16384, -16384]);
        assert_eq!(decode_with_symphonia(&stereo, "wav", &processor).unwrap(), vec![0.25, -0.5]);

        let slow = write_wav(&dir, "slow.wav", 8_000, 1, pcm);
        let err = decode_with_symphonia(&slow, "wav", &processor).unwrap_err();
        assert!(err.to_string().contains("Sample rate mismatch"));
    }

    #[test]
    fn test_garbage_flac_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.flac");
        std::fs::write(&path, b"not audio data").unwrap();
        assert!(load_audio(&path).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(load_audio(Path::new("/nonexistent/utt.flac")).is_err());
    }
}
