use super::fuse::{embed_tokens, fuse_and_expand};
use super::inference::{InferenceEngine, Phone2FuseOutput, Phone2FuseOutputs};
use super::reference::{ReferenceArrays, ReferenceReport};
use super::tables::FuseTables;
use super::vocoder::{mel_to_linear, GriffinLim, GriffinLimConfig};

/// Number of phoneme tokens consumed per call.
pub const NUM_TOKENS: usize = 31;

/// Time dimension of the fuse2mel input.
pub const TIMESTEPS: usize = 300;

/// Width of one fused frame (four sources of `DIM_FEAT` each).
pub const DIM_FUSE: usize = 128;

/// Width of each of the four fused sources.
pub const DIM_FEAT: usize = 32;

/// Width of the token embedding fed to phone2fuse.
pub const DIM_FEAT_INPUT: usize = 128;

pub const NUM_EMBEDS_PITCH: usize = 32;
pub const NUM_EMBEDS_ENERGY: usize = 32;

/// Number of mel bands produced by fuse2mel.
pub const NUM_MELS: usize = 80;

pub const WINDOW_SIZE: usize = 1024;
pub const HOP_SIZE: usize = 256;
pub const FFT_SIZE: usize = 1024;
pub const NUM_FFT_BINS: usize = FFT_SIZE / 2 + 1;
pub const ITERS_GRIFFIN_LIN: usize = 5;

/// Effective scale of the int16 embedding tables (Q11).
pub const WEIGHT_SCALE: f32 = 1.0 / (1 << 11) as f32;

/// Fixed-point scale of spectra: a real magnitude of 1.0 is a full-scale Q15 sample.
pub const SPEC_UPSCALE: f32 = 32768.0;

/// Output sample rate.
pub const SAMPLE_RATE: u32 = 16000;

/// Leading waveform samples compared against a reference run.
pub const REFERENCE_SAMPLES: usize = 10;

/// Token sequence the bundled reference arrays were produced from.
pub const REFERENCE_TOKENS: [i16; NUM_TOKENS] = [
    92, 74, 117, 145, 110, 117, 89, 131, 83, 120, 105, 67, 117, 132, 116, 75, 119, 130, 132, 124,
    144, 98, 92, 74, 118, 103, 147, 113, 91, 79, 106,
];

#[derive(thiserror::Error, Debug)]
pub enum TtsError {
    #[error("ONNX runtime error: {0}")]
    Runtime(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse table file: {0}")]
    TableParse(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Model not loaded. Call load_model() first.")]
    ModelNotLoaded,
    #[error("{engine} failed to initialize: {reason}")]
    Initialization { engine: String, reason: String },
    #[error("{engine} inference failed: {reason}")]
    Invocation { engine: String, reason: String },
    #[error("predicted durations need {needed} frames but only {capacity} are available")]
    DurationOverflow { needed: usize, capacity: usize },
    #[error("Griffin-Lim needs at least one frame, got {0}")]
    InvalidFrameCount(usize),
    #[error("token id {id} at position {position} is outside the embedding table ({rows} rows)")]
    TokenOutOfRange { id: i16, position: usize, rows: usize },
    #[error("Tensor shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("{name} differs from reference: {mismatches} values off by up to {max_abs_error}")]
    ReferenceMismatch {
        name: String,
        mismatches: usize,
        max_abs_error: i64,
    },
}

impl TtsError {
    /// Non-zero status code for callers that report a single integer.
    pub fn status_code(&self) -> i32 {
        match self {
            TtsError::Runtime(_)
            | TtsError::Io(_)
            | TtsError::TableParse(_)
            | TtsError::Config(_) => 2,
            TtsError::ModelNotLoaded | TtsError::Initialization { .. } => 1,
            TtsError::Invocation { .. } => 3,
            TtsError::DurationOverflow { .. } => 4,
            TtsError::InvalidFrameCount(_) => 5,
            TtsError::TokenOutOfRange { .. } | TtsError::ShapeMismatch(_) => 6,
            TtsError::ReferenceMismatch { .. } => 7,
        }
    }
}

impl From<derive_builder::UninitializedFieldError> for TtsError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        TtsError::Config(format!("missing field `{}`", err.field_name()))
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for TtsError {
    fn from(err: ort::Error) -> Self {
        TtsError::Runtime(err.to_string())
    }
}

#[cfg(feature = "onnx")]
impl From<ndarray::ShapeError> for TtsError {
    fn from(err: ndarray::ShapeError) -> Self {
        TtsError::ShapeMismatch(err.to_string())
    }
}

/// Output of one full pipeline call.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// PCM16 samples, `frame_count * HOP_SIZE` long.
    pub samples: Vec<i16>,
    /// Number of expanded time steps (sum of the predicted durations).
    pub frame_count: usize,
}

/// Per-call pipeline state: the two inference engines.
///
/// Each engine owns its own input/output buffers, so a context must not be
/// shared between concurrent calls.
pub struct TtsContext<P, F> {
    phone2fuse: P,
    fuse2mel: F,
}

impl<P: InferenceEngine, F: InferenceEngine> TtsContext<P, F> {
    pub fn new(phone2fuse: P, fuse2mel: F) -> Self {
        Self {
            phone2fuse,
            fuse2mel,
        }
    }

    pub fn phone2fuse(&self) -> &P {
        &self.phone2fuse
    }

    pub fn fuse2mel(&self) -> &F {
        &self.fuse2mel
    }

    /// Run tokens -> waveform once.
    pub fn run(
        &mut self,
        tokens: &[i16],
        tables: &FuseTables,
        config: &GriffinLimConfig,
    ) -> Result<Synthesis, TtsError> {
        self.run_phone2fuse(tokens, tables)?;
        let frame_count = self.run_fuse2mel(tables)?;
        let samples = self.griffin_lim(frame_count, tables, config)?;
        Ok(Synthesis {
            samples,
            frame_count,
        })
    }

    /// Embed `tokens` into the phone2fuse input and invoke it.
    pub fn run_phone2fuse(&mut self, tokens: &[i16], tables: &FuseTables) -> Result<(), TtsError> {
        let input = self.phone2fuse.input_mut(0)?;
        embed_tokens(tokens, &tables.input_embed, input)?;

        self.phone2fuse.invoke()?;
        log::debug!("{} finished", self.phone2fuse.name());
        Ok(())
    }

    /// Fuse the phone2fuse outputs into the fuse2mel input, expand durations
    /// and invoke fuse2mel. Returns the expanded frame count.
    pub fn run_fuse2mel(&mut self, tables: &FuseTables) -> Result<usize, TtsError> {
        let sources = Phone2FuseOutputs::from_engine(&self.phone2fuse)?;
        let input = self.fuse2mel.input_mut(0)?;
        input.clear();
        let frames = fuse_and_expand(&sources, tables, input)?;
        log::debug!("expanded {} tokens into {frames} frames", sources.num_tokens());

        self.fuse2mel.invoke()?;
        log::debug!("{} finished", self.fuse2mel.name());
        Ok(frames)
    }

    /// Log-mel output of the last fuse2mel invocation.
    pub fn mel_spectrogram(&self) -> Result<&super::tensor::Tensor2D, TtsError> {
        self.fuse2mel.output(0)
    }

    /// Vocode the first `total_frames` frames of the last fuse2mel output.
    pub fn griffin_lim(
        &self,
        total_frames: usize,
        tables: &FuseTables,
        config: &GriffinLimConfig,
    ) -> Result<Vec<i16>, TtsError> {
        if total_frames == 0 {
            return Err(TtsError::InvalidFrameCount(total_frames));
        }
        let mel = self.mel_spectrogram()?;
        let magnitudes = mel_to_linear(mel, total_frames, &tables.mel_inverse)?;
        let mut vocoder = GriffinLim::new(config.clone());
        let waveform = vocoder.reconstruct(&magnitudes)?;
        Ok(waveform.to_pcm16())
    }

    /// Invoke phone2fuse on a raw input buffer instead of embedded tokens.
    pub fn replay_phone2fuse(&mut self, input: &[i16]) -> Result<(), TtsError> {
        self.phone2fuse.input_mut(0)?.load_raw(input)?;
        self.phone2fuse.invoke()
    }

    /// Invoke fuse2mel on a raw input buffer instead of fused stage-1 outputs.
    pub fn replay_fuse2mel(&mut self, input: &[i16]) -> Result<(), TtsError> {
        self.fuse2mel.input_mut(0)?.load_raw(input)?;
        self.fuse2mel.invoke()
    }

    /// Compare the outputs of the last phone2fuse invocation with reference arrays.
    pub fn check_phone2fuse_outputs(
        &self,
        reference: &[(Phone2FuseOutput, Vec<i16>)],
        tolerance: i64,
    ) -> Result<Vec<ReferenceReport>, TtsError> {
        reference
            .iter()
            .map(|(which, expected)| {
                let output = self.phone2fuse.output(which.index())?;
                Ok(ReferenceReport::compare(
                    &format!("phone2fuse {}", which.name()),
                    output.data(),
                    expected,
                    tolerance,
                ))
            })
            .collect()
    }

    /// Compare the output of the last fuse2mel invocation with a reference array.
    pub fn check_fuse2mel_output(
        &self,
        reference: &[i16],
        tolerance: i64,
    ) -> Result<ReferenceReport, TtsError> {
        let output = self.fuse2mel.output(0)?;
        Ok(ReferenceReport::compare(
            "fuse2mel output",
            output.data(),
            reference,
            tolerance,
        ))
    }

    /// Check both networks and the full pipeline against `reference`.
    ///
    /// Each network is first replayed on its recorded input, then `tokens`
    /// run end to end and every stage plus the leading
    /// [`REFERENCE_SAMPLES`] of the waveform is compared. Returns one report
    /// per comparison; failing reports are not turned into errors here.
    pub fn verify(
        &mut self,
        tokens: &[i16],
        tables: &FuseTables,
        config: &GriffinLimConfig,
        reference: &ReferenceArrays,
        tolerance: i64,
    ) -> Result<Vec<ReferenceReport>, TtsError> {
        let mut reports = Vec::new();

        if let Some(input) = &reference.phone2fuse_input {
            self.replay_phone2fuse(input)?;
            reports.extend(replayed(
                self.check_phone2fuse_outputs(&reference.phone2fuse_outputs, tolerance)?,
            ));
        }
        if let (Some(input), Some(output)) = (&reference.fuse2mel_input, &reference.fuse2mel_output)
        {
            self.replay_fuse2mel(input)?;
            reports.extend(replayed(vec![self.check_fuse2mel_output(output, tolerance)?]));
        }

        let synthesis = self.run(tokens, tables, config)?;
        reports.extend(self.check_phone2fuse_outputs(&reference.phone2fuse_outputs, tolerance)?);
        if let Some(input) = &reference.fuse2mel_input {
            reports.push(self.check_fuse2mel_input(input, tolerance)?);
        }
        if let Some(output) = &reference.fuse2mel_output {
            reports.push(self.check_fuse2mel_output(output, tolerance)?);
        }
        if let Some(expected) = &reference.waveform {
            let n = expected.len().min(REFERENCE_SAMPLES);
            let samples = &synthesis.samples[..n.min(synthesis.samples.len())];
            reports.push(ReferenceReport::compare(
                "waveform",
                samples,
                &expected[..n],
                tolerance,
            ));
        }
        Ok(reports)
    }

    /// Compare the fuse2mel input prepared by the last call with a reference array.
    pub fn check_fuse2mel_input(
        &self,
        reference: &[i16],
        tolerance: i64,
    ) -> Result<ReferenceReport, TtsError> {
        let input = self.fuse2mel.input(0)?;
        Ok(ReferenceReport::compare(
            "fuse2mel input",
            input.data(),
            reference,
            tolerance,
        ))
    }
}

fn replayed(reports: Vec<ReferenceReport>) -> impl Iterator<Item = ReferenceReport> {
    reports.into_iter().map(|mut report| {
        report.name.push_str(" (replayed input)");
        report
    })
}
