//! Countdown asset decoding from a local directory.

use log::{debug, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use super::SoundBuffer;
use crate::traits::AssetSource;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported audio in {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },
    #[error("{0} decoded to no samples")]
    Empty(PathBuf),
}

/// Reads `<dir>/<name>.<ext>` for each requested asset.
pub struct DirAssetSource {
    dir: PathBuf,
    ext: String,
}

impl DirAssetSource {
    pub fn new(dir: impl Into<PathBuf>, ext: &str) -> Self {
        DirAssetSource {
            dir: dir.into(),
            ext: ext.to_string(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, self.ext))
    }
}

impl AssetSource for DirAssetSource {
    fn load(&self, name: &str) -> anyhow::Result<SoundBuffer> {
        Ok(decode_file(&self.path_for(name))?)
    }
}

/// Decode an audio file into a mono buffer.
pub fn decode_file(path: &Path) -> Result<SoundBuffer, AssetError> {
    let unsupported = |reason: String| AssetError::Unsupported {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| AssetError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unsupported("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| unsupported("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut channels = 1usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                warn!("[Audio] Error reading packet from {}: {}", path.display(), e);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("[Audio] Skipping undecodable packet: {}", e);
                continue;
            }
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels = spec.channels.count().max(1);
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend(downmix(buf.samples(), channels));
        }
    }

    if samples.is_empty() {
        return Err(AssetError::Empty(path.to_path_buf()));
    }
    Ok(SoundBuffer { samples, sample_rate })
}

fn downmix(interleaved: &[f32], channels: usize) -> impl Iterator<Item = f32> + '_ {
    interleaved
        .chunks(channels)
        .map(move |frame| frame.iter().sum::<f32>() / channels as f32)
}
