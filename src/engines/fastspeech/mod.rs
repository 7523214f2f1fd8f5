//! Quantized two-stage synthesis engine.
//!
//! A token sequence runs through two int16 networks bridged by fixed-point
//! fusion code, and the resulting log-mel spectrogram is turned into audio
//! with Griffin-Lim:
//!
//! ```text
//! tokens ─▶ token embedding ─▶ phone2fuse ─▶ fuse + duration expansion
//!        ─▶ fuse2mel ─▶ mel-to-linear ─▶ Griffin-Lim ─▶ PCM16
//! ```
//!
//! # Model Directory Layout
//!
//! ```text
//! models/fastspeech/
//! ├── phone2fuse.onnx   # stage 1 (needs the `onnx` feature)
//! ├── fuse2mel.onnx     # stage 2 (needs the `onnx` feature)
//! ├── quant.json        # scale / zero point of every model tensor
//! └── tables.npz        # embeddings, bin boundaries, mel inverse
//! ```
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use quant_tts::{SynthesisEngine, engines::fastspeech::{FastSpeechEngine, REFERENCE_TOKENS}};
//! use std::path::PathBuf;
//!
//! let mut engine = FastSpeechEngine::new();
//! engine.load_model(&PathBuf::from("models/fastspeech"))?;
//!
//! let result = engine.synthesize(&REFERENCE_TOKENS, None)?;
//! println!("Generated {} samples at {}Hz", result.samples.len(), result.sample_rate);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Explicit Griffin-Lim Settings
//!
//! ```rust,no_run
//! use quant_tts::{SynthesisEngine, engines::fastspeech::*};
//! use std::path::PathBuf;
//!
//! let mut engine = FastSpeechEngine::new();
//! engine.load_model(&PathBuf::from("models/fastspeech"))?;
//!
//! let params = FastSpeechInferenceParams {
//!     griffin_lim: GriffinLimConfig::builder()
//!         .iterations(8)
//!         .phase_init(PhaseInit::Zero)
//!         .build()?,
//! };
//!
//! engine.synthesize_to_file(&REFERENCE_TOKENS, &PathBuf::from("out.wav"), Some(params))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engine;
pub mod fuse;
pub mod inference;
pub mod model;
pub mod quant;
pub mod reference;
pub mod tables;
pub mod tensor;
pub mod vocoder;

pub use engine::{FastSpeechEngine, FastSpeechInferenceParams, FastSpeechModelParams};
pub use inference::{InferenceEngine, Phone2FuseOutput, Phone2FuseOutputs};
pub use model::{Synthesis, TtsContext, TtsError, REFERENCE_TOKENS};
pub use quant::QuantParams;
pub use reference::{ReferenceArrays, ReferenceReport};
pub use tables::FuseTables;
pub use tensor::{Layout, Tensor2D};
pub use vocoder::{GriffinLim, GriffinLimConfig, PhaseInit};
