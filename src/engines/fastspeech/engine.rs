use std::path::Path;

use crate::{SynthesisEngine, SynthesisResult};

use super::inference::InferenceEngine;
use super::model::{TtsContext, TtsError, REFERENCE_TOKENS, SAMPLE_RATE};
use super::reference::{ReferenceArrays, ReferenceReport};
use super::tables::FuseTables;
use super::vocoder::{GriffinLimConfig, PhaseInit};

/// Seed used by [`FastSpeechInferenceParams::default`].
pub const DEFAULT_PHASE_SEED: u64 = 0x5eed;

type BoxedContext = TtsContext<Box<dyn InferenceEngine>, Box<dyn InferenceEngine>>;

/// Parameters for configuring model loading.
#[derive(Debug, Clone)]
pub struct FastSpeechModelParams {
    /// Number of CPU threads per ONNX session.
    /// `None` uses the ORT default.
    pub num_threads: Option<usize>,
    /// Table archive inside the model directory.
    pub tables_file: String,
}

impl Default for FastSpeechModelParams {
    fn default() -> Self {
        Self {
            num_threads: None,
            tables_file: "tables.npz".to_string(),
        }
    }
}

/// Parameters for one synthesis call.
#[derive(Debug, Clone)]
pub struct FastSpeechInferenceParams {
    pub griffin_lim: GriffinLimConfig,
}

impl Default for FastSpeechInferenceParams {
    /// Five iterations from seeded random phase ([`DEFAULT_PHASE_SEED`]).
    fn default() -> Self {
        Self {
            griffin_lim: GriffinLimConfig {
                iterations: super::model::ITERS_GRIFFIN_LIN,
                phase_init: PhaseInit::Random {
                    seed: DEFAULT_PHASE_SEED,
                },
            },
        }
    }
}

/// Two-stage quantized TTS engine: phone2fuse, fusion, fuse2mel, Griffin-Lim.
///
/// # Quick Start
///
/// ```rust,no_run
/// use quant_tts::{SynthesisEngine, engines::fastspeech::{FastSpeechEngine, REFERENCE_TOKENS}};
/// use std::path::PathBuf;
///
/// let mut engine = FastSpeechEngine::new();
/// engine.load_model(&PathBuf::from("models/fastspeech"))?;
/// let result = engine.synthesize(&REFERENCE_TOKENS, None)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct FastSpeechEngine {
    context: Option<BoxedContext>,
    tables: Option<FuseTables>,
}

impl Default for FastSpeechEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FastSpeechEngine {
    pub fn new() -> Self {
        Self {
            context: None,
            tables: None,
        }
    }

    /// Build a loaded engine from already constructed inference engines.
    pub fn from_parts(
        phone2fuse: Box<dyn InferenceEngine>,
        fuse2mel: Box<dyn InferenceEngine>,
        tables: FuseTables,
    ) -> Self {
        Self {
            context: Some(TtsContext::new(phone2fuse, fuse2mel)),
            tables: Some(tables),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.context.is_some()
    }

    /// Run [`REFERENCE_TOKENS`] through both networks and the vocoder and
    /// compare every stage with `reference`.
    pub fn verify_reference(
        &mut self,
        reference: &ReferenceArrays,
        config: &GriffinLimConfig,
        tolerance: i64,
    ) -> Result<Vec<ReferenceReport>, TtsError> {
        let context = self.context.as_mut().ok_or(TtsError::ModelNotLoaded)?;
        let tables = self.tables.as_ref().ok_or(TtsError::ModelNotLoaded)?;
        context.verify(&REFERENCE_TOKENS, tables, config, reference, tolerance)
    }

    /// Vocode the last fuse2mel output stand-alone.
    pub fn griffin_lim(
        &self,
        total_frames: usize,
        config: &GriffinLimConfig,
    ) -> Result<Vec<i16>, TtsError> {
        let (context, tables) = self.loaded()?;
        context.griffin_lim(total_frames, tables, config)
    }

    fn loaded(&self) -> Result<(&BoxedContext, &FuseTables), TtsError> {
        match (&self.context, &self.tables) {
            (Some(context), Some(tables)) => Ok((context, tables)),
            _ => Err(TtsError::ModelNotLoaded),
        }
    }

    #[cfg(feature = "onnx")]
    fn load_context(
        model_path: &Path,
        params: &FastSpeechModelParams,
    ) -> Result<BoxedContext, TtsError> {
        use super::inference::{OnnxEngine, QuantConfig};

        let quant = QuantConfig::load(&model_path.join("quant.json"))?;
        let phone2fuse = OnnxEngine::load(
            "phone2fuse",
            &model_path.join("phone2fuse.onnx"),
            &quant.phone2fuse,
            params.num_threads,
        )?;
        let fuse2mel = OnnxEngine::load(
            "fuse2mel",
            &model_path.join("fuse2mel.onnx"),
            &quant.fuse2mel,
            params.num_threads,
        )?;
        Ok(TtsContext::new(Box::new(phone2fuse), Box::new(fuse2mel)))
    }

    #[cfg(not(feature = "onnx"))]
    fn load_context(
        _model_path: &Path,
        _params: &FastSpeechModelParams,
    ) -> Result<BoxedContext, TtsError> {
        Err(TtsError::Config(
            "built without the `onnx` feature; use FastSpeechEngine::from_parts".to_string(),
        ))
    }
}

impl Drop for FastSpeechEngine {
    fn drop(&mut self) {
        self.unload_model();
    }
}

impl SynthesisEngine for FastSpeechEngine {
    type SynthesisParams = FastSpeechInferenceParams;
    type ModelParams = FastSpeechModelParams;

    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let context = Self::load_context(model_path, &params)?;
        let tables = FuseTables::load(&model_path.join(&params.tables_file))?;
        self.context = Some(context);
        self.tables = Some(tables);
        Ok(())
    }

    fn unload_model(&mut self) {
        self.context = None;
        self.tables = None;
    }

    fn synthesize(
        &mut self,
        tokens: &[i16],
        params: Option<Self::SynthesisParams>,
    ) -> Result<SynthesisResult, Box<dyn std::error::Error>> {
        let context = self.context.as_mut().ok_or(TtsError::ModelNotLoaded)?;
        let tables = self.tables.as_ref().ok_or(TtsError::ModelNotLoaded)?;

        let p = params.unwrap_or_default();
        let synthesis = context.run(tokens, tables, &p.griffin_lim).map_err(|e| {
            log::error!("synthesis failed (status {}): {e}", e.status_code());
            e
        })?;
        log::info!(
            "Synthesized {} frames ({} samples)",
            synthesis.frame_count,
            synthesis.samples.len()
        );

        Ok(SynthesisResult {
            samples: synthesis.samples,
            sample_rate: SAMPLE_RATE,
        })
    }
}
