//! # quant-tts
//!
//! A Rust library for quantized two-stage text-to-speech synthesis.
//!
//! ## Features
//!
//! - **Fixed-point fusion**: requantization, pitch/energy binning and
//!   duration expansion between the two int16 networks
//! - **Griffin-Lim vocoder**: magnitude-only spectrogram inversion with
//!   seeded or zero initial phase
//! - **Pluggable inference**: any engine exposing quantized tensors, with an
//!   ONNX Runtime backend behind the `onnx` feature
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! quant-tts = { version = "2026.2", features = ["onnx"] }
//! ```
//!
//! ```ignore
//! use std::path::PathBuf;
//! use quant_tts::{engines::fastspeech::{FastSpeechEngine, REFERENCE_TOKENS}, SynthesisEngine};
//!
//! let mut engine = FastSpeechEngine::new();
//! engine.load_model(&PathBuf::from("models/fastspeech"))?;
//!
//! let result = engine.synthesize(&REFERENCE_TOKENS, None)?;
//! result.write_wav(&PathBuf::from("output.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engines;

use std::path::Path;

/// The result of a synthesis operation.
///
/// Contains PCM16 audio samples and the sample rate of the output audio.
#[derive(Debug)]
pub struct SynthesisResult {
    /// Signed 16-bit audio samples
    pub samples: Vec<i16>,
    /// Sample rate of the audio
    pub sample_rate: u32,
}

impl SynthesisResult {
    /// Write the audio to a 16-bit PCM WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Common interface for speech synthesis engines.
///
/// Engines take an already tokenized phoneme sequence. Each engine may have
/// different parameter types for model loading and inference configuration.
pub trait SynthesisEngine {
    /// Parameters for configuring inference behavior
    type SynthesisParams;
    /// Parameters for configuring model loading (threads, etc.)
    type ModelParams: Default;

    /// Load a model from the specified path using default parameters.
    fn load_model(&mut self, model_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        self.load_model_with_params(model_path, Self::ModelParams::default())
    }

    /// Load a model from the specified path with custom parameters.
    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Unload the currently loaded model and free associated resources.
    fn unload_model(&mut self);

    /// Synthesize speech from a phoneme token sequence.
    fn synthesize(
        &mut self,
        tokens: &[i16],
        params: Option<Self::SynthesisParams>,
    ) -> Result<SynthesisResult, Box<dyn std::error::Error>>;

    /// Synthesize speech and write it to a WAV file.
    ///
    /// Default implementation calls `synthesize()` then `SynthesisResult::write_wav()`.
    fn synthesize_to_file(
        &mut self,
        tokens: &[i16],
        wav_path: &Path,
        params: Option<Self::SynthesisParams>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.synthesize(tokens, params)?.write_wav(wav_path)
    }
}
