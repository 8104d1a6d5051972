use std::sync::Arc;

use thiserror::Error;

use popwatch_audio::{chunk_rms, Window};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Window too short: {got} samples, need at least {min}")]
    TooShort { got: usize, min: usize },
    #[error("Malformed window: {0}")]
    Malformed(String),
}

/// Row-major frame features, one row per short-time analysis frame.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    values: Vec<f32>,
    feature_count: usize,
}

impl FeatureMatrix {
    pub fn new(values: Vec<f32>, feature_count: usize) -> Result<Self, ExtractionError> {
        if feature_count == 0 || values.len() % feature_count != 0 {
            return Err(ExtractionError::Malformed(format!(
                "{} values do not divide into rows of {}",
                values.len(),
                feature_count
            )));
        }
        Ok(Self {
            values,
            feature_count,
        })
    }

    pub fn frames(&self) -> usize {
        self.values.len() / self.feature_count
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.feature_count;
        &self.values[start..start + self.feature_count]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(self.feature_count)
    }
}

/// Turns a window into frame features for the detector.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, window: &Window) -> Result<FeatureMatrix, ExtractionError>;
}

/// Decides whether a feature matrix contains an anomaly. Implementations
/// wrap whatever model is in use.
pub trait AnomalyDetector: Send + Sync {
    fn detect(&self, features: &FeatureMatrix) -> bool;
}

/// Extractor and detector pair handed to every analysis worker.
#[derive(Clone)]
pub struct AnalysisProvider {
    pub extractor: Arc<dyn FeatureExtractor>,
    pub detector: Arc<dyn AnomalyDetector>,
}

impl Default for AnalysisProvider {
    fn default() -> Self {
        Self {
            extractor: Arc::new(ShortTimeEnergyExtractor::default()),
            detector: Arc::new(EnergySpikeDetector::default()),
        }
    }
}

/// Scales samples so the largest magnitude is 1.0. Near-silent input is
/// left untouched to avoid amplifying noise.
pub fn normalize_peak(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 1e-6 {
        let inv = 1.0 / peak;
        for s in samples.iter_mut() {
            *s *= inv;
        }
    }
}

/// Time-domain frame features: RMS, zero-crossing rate, and energy delta
/// against the previous frame.
pub struct ShortTimeEnergyExtractor {
    pub frame_len: usize,
    pub hop_len: usize,
}

impl Default for ShortTimeEnergyExtractor {
    fn default() -> Self {
        Self {
            frame_len: 2048,
            hop_len: 512,
        }
    }
}

impl ShortTimeEnergyExtractor {
    pub fn new(frame_len: usize, hop_len: usize) -> Self {
        Self { frame_len, hop_len }
    }
}

impl FeatureExtractor for ShortTimeEnergyExtractor {
    fn extract(&self, window: &Window) -> Result<FeatureMatrix, ExtractionError> {
        if window.len() < self.frame_len {
            return Err(ExtractionError::TooShort {
                got: window.len(),
                min: self.frame_len,
            });
        }
        if window.samples.iter().any(|s| !s.is_finite()) {
            return Err(ExtractionError::Malformed(
                "non-finite sample in window".to_string(),
            ));
        }

        let mut values = Vec::new();
        let mut prev_energy = 0.0f32;
        let mut first = true;
        let mut start = 0;
        while start + self.frame_len <= window.samples.len() {
            let frame = &window.samples[start..start + self.frame_len];
            let rms = chunk_rms(frame);
            let zcr = zero_crossing_rate(frame);
            let energy = rms * rms;
            let delta = if first { 0.0 } else { energy - prev_energy };
            values.extend_from_slice(&[rms, zcr, delta]);
            prev_energy = energy;
            first = false;
            start += self.hop_len;
        }

        FeatureMatrix::new(values, 3)
    }
}

fn zero_crossing_rate(frame: &[f32]) -> f32 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / (frame.len() - 1) as f32
}

/// Flags a window when one frame's RMS towers over the window average.
/// Stand-in for model-backed classification with the same per-frame shape.
pub struct EnergySpikeDetector {
    pub ratio: f32,
    pub min_rms: f32,
}

impl Default for EnergySpikeDetector {
    fn default() -> Self {
        Self {
            ratio: 4.0,
            min_rms: 0.05,
        }
    }
}

impl AnomalyDetector for EnergySpikeDetector {
    fn detect(&self, features: &FeatureMatrix) -> bool {
        let frames = features.frames();
        if frames == 0 {
            return false;
        }
        let mean: f32 = features.rows().map(|row| row[0]).sum::<f32>() / frames as f32;
        features
            .rows()
            .any(|row| row[0] > self.ratio * mean && row[0] > self.min_rms)
    }
}
