//! Speech synthesis engines.
//!
//! This module contains implementations of text-to-speech engines.
//!
//! # Available Engines
//!
//! - `fastspeech` - quantized phone2fuse / fuse2mel pipeline with a
//!   Griffin-Lim vocoder. Loading models from disk needs the `onnx` feature;
//!   any [`fastspeech::InferenceEngine`] can be plugged in otherwise.

pub mod fastspeech;
