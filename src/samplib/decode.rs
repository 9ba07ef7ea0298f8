//! Default WAV decoder backed by hound.

use std::path::Path;

use crate::samplib::{AudioData, AudioDecoder};
use crate::types::LoadError;

pub struct HoundDecoder;

impl AudioDecoder for HoundDecoder {
    fn decode(&self, path: &Path) -> Result<AudioData, LoadError> {
        if !path.exists() {
            return Err(LoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let mut reader = hound::WavReader::open(path).map_err(|e| LoadError::FileReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let spec = reader.spec();

        validate_format(&spec).map_err(|detail| LoadError::UnsupportedFormat {
            path: path.display().to_string(),
            detail,
        })?;

        let decode_err = |e: hound::Error| LoadError::DecodingError {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let mut samples: Vec<f32> =
            Vec::with_capacity(reader.len() as usize);
        match spec.sample_format {
            hound::SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    samples.push(sample.map_err(decode_err)?);
                }
            }
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                match spec.bits_per_sample {
                    8 => {
                        for sample in reader.samples::<i8>() {
                            samples.push(sample.map_err(decode_err)? as f32 * scale);
                        }
                    }
                    16 => {
                        for sample in reader.samples::<i16>() {
                            samples.push(sample.map_err(decode_err)? as f32 * scale);
                        }
                    }
                    24 | 32 => {
                        for sample in reader.samples::<i32>() {
                            samples.push(sample.map_err(decode_err)? as f32 * scale);
                        }
                    }
                    _ => unreachable!("validated above"),
                }
            }
        }

        let stereo = to_stereo(&samples, spec.channels);
        let num_frames = (stereo.len() / 2) as u32;

        Ok(AudioData {
            num_frames,
            sample_rate: spec.sample_rate,
            channels: spec.channels as u8,
            samples: stereo.into_boxed_slice(),
        })
    }
}

fn validate_format(spec: &hound::WavSpec) -> Result<(), String> {
    if spec.sample_rate < 8000 || spec.sample_rate > 192_000 {
        return Err(format!("sample rate {} out of range", spec.sample_rate));
    }
    if spec.channels == 0 || spec.channels > 8 {
        return Err(format!("{} channels", spec.channels));
    }
    match spec.sample_format {
        hound::SampleFormat::Float => {
            if spec.bits_per_sample != 32 {
                return Err(format!("{}-bit float", spec.bits_per_sample));
            }
        }
        hound::SampleFormat::Int => {
            if !matches!(spec.bits_per_sample, 8 | 16 | 24 | 32) {
                return Err(format!("{}-bit integer", spec.bits_per_sample));
            }
        }
    }
    Ok(())
}

fn to_stereo(audio: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        1 => {
            let mut stereo = Vec::with_capacity(audio.len() * 2);
            for &sample in audio {
                stereo.push(sample);
                stereo.push(sample);
            }
            stereo
        }
        2 => audio.to_vec(),
        _ => {
            // Take the first two channels of multichannel material.
            let mut stereo = Vec::with_capacity((audio.len() / channels as usize) * 2);
            for chunk in audio.chunks_exact(channels as usize) {
                stereo.push(chunk[0]);
                stereo.push(chunk[1]);
            }
            stereo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, channels: u16, frames: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in frames {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn decodes_mono_to_stereo_interleaved() {
        let dir = std::env::temp_dir().join("opal_decode_test_mono");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mono.wav");
        write_test_wav(&path, 1, &[16384, -16384]);

        let audio = HoundDecoder.decode(&path).unwrap();
        assert_eq!(audio.num_frames, 2);
        assert_eq!(audio.channels, 1);
        assert!((audio.samples[0] - 0.5).abs() < 1e-4);
        assert_eq!(audio.samples[0], audio.samples[1]);
        assert!((audio.samples[2] + 0.5).abs() < 1e-4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn decodes_stereo_unchanged() {
        let dir = std::env::temp_dir().join("opal_decode_test_stereo");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stereo.wav");
        write_test_wav(&path, 2, &[8192, -8192, 0, 32767]);

        let audio = HoundDecoder.decode(&path).unwrap();
        assert_eq!(audio.num_frames, 2);
        assert!((audio.samples[0] - 0.25).abs() < 1e-4);
        assert!((audio.samples[1] + 0.25).abs() < 1e-4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_reports_file_not_found() {
        let result = HoundDecoder.decode(Path::new("/nonexistent/nope.wav"));
        assert!(matches!(result, Err(LoadError::FileNotFound { .. })));
    }
}
