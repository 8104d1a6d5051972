use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use popwatch_audio::{ChannelKey, Window};

/// Writes each window for one channel as a mono 16-bit WAV, numbered in
/// emission order, for offline listening and training data collection.
pub struct WindowDumper {
    dir: PathBuf,
    prefix: String,
    seq: u64,
}

impl WindowDumper {
    pub fn new(dir: &Path, key: &ChannelKey) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix: file_prefix(key),
            seq: 0,
        })
    }

    pub fn write(&mut self, window: &Window) -> Result<PathBuf, hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: window.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path = self.dir.join(format!("{}-{:06}.wav", self.prefix, self.seq));
        let mut writer = WavWriter::create(&path, spec)?;
        for &sample in &window.samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
        self.seq += 1;
        Ok(path)
    }
}

fn file_prefix(key: &ChannelKey) -> String {
    let device: String = key
        .device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}-ch{}", device, key.channel_index)
}
