//! Boundary to the two quantized inference engines.
//!
//! The pipeline only ever talks to an engine through [`InferenceEngine`]:
//! fill an input tensor, invoke, read output tensors. Each tensor carries its
//! own (scale, zero point).

use super::model::{TtsError, DIM_FEAT};
use super::tensor::Tensor2D;

pub trait InferenceEngine {
    /// Engine name used in logs and errors.
    fn name(&self) -> &str;

    fn input(&self, index: usize) -> Result<&Tensor2D, TtsError>;

    fn input_mut(&mut self, index: usize) -> Result<&mut Tensor2D, TtsError>;

    /// Run the network on the current inputs, refreshing every output.
    fn invoke(&mut self) -> Result<(), TtsError>;

    fn output(&self, index: usize) -> Result<&Tensor2D, TtsError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn input(&self, index: usize) -> Result<&Tensor2D, TtsError> {
        (**self).input(index)
    }

    fn input_mut(&mut self, index: usize) -> Result<&mut Tensor2D, TtsError> {
        (**self).input_mut(index)
    }

    fn invoke(&mut self) -> Result<(), TtsError> {
        (**self).invoke()
    }

    fn output(&self, index: usize) -> Result<&Tensor2D, TtsError> {
        (**self).output(index)
    }
}

/// Output tensors of phone2fuse, by position in the model's output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phone2FuseOutput {
    DurationTarget = 0,
    Pitch = 1,
    DurationFeatures = 2,
    FusedFeatures = 3,
    Energy = 4,
}

impl Phone2FuseOutput {
    pub const ALL: [Phone2FuseOutput; 5] = [
        Phone2FuseOutput::DurationTarget,
        Phone2FuseOutput::Pitch,
        Phone2FuseOutput::DurationFeatures,
        Phone2FuseOutput::FusedFeatures,
        Phone2FuseOutput::Energy,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Phone2FuseOutput::DurationTarget => "duration_target",
            Phone2FuseOutput::Pitch => "pitch",
            Phone2FuseOutput::DurationFeatures => "duration_features",
            Phone2FuseOutput::FusedFeatures => "fused_features",
            Phone2FuseOutput::Energy => "energy",
        }
    }

    /// Feature width of this output per token.
    pub fn width(self) -> usize {
        match self {
            Phone2FuseOutput::DurationFeatures | Phone2FuseOutput::FusedFeatures => DIM_FEAT,
            _ => 1,
        }
    }
}

/// The phone2fuse outputs resolved once by name.
///
/// Every tensor has one column per token; `duration_target`, `pitch` and
/// `energy` are one feature wide, the other two `DIM_FEAT` wide.
#[derive(Debug, Clone, Copy)]
pub struct Phone2FuseOutputs<'a> {
    pub duration_target: &'a Tensor2D,
    pub pitch: &'a Tensor2D,
    pub duration_features: &'a Tensor2D,
    pub fused_features: &'a Tensor2D,
    pub energy: &'a Tensor2D,
}

impl<'a> Phone2FuseOutputs<'a> {
    pub fn from_engine<E: InferenceEngine + ?Sized>(engine: &'a E) -> Result<Self, TtsError> {
        let get = |which: Phone2FuseOutput| -> Result<&'a Tensor2D, TtsError> {
            let tensor = engine.output(which.index())?;
            if tensor.features() != which.width() {
                return Err(TtsError::ShapeMismatch(format!(
                    "{} output {:?} has {} features, expected {}",
                    engine.name(),
                    which,
                    tensor.features(),
                    which.width()
                )));
            }
            Ok(tensor)
        };

        let outputs = Self {
            duration_target: get(Phone2FuseOutput::DurationTarget)?,
            pitch: get(Phone2FuseOutput::Pitch)?,
            duration_features: get(Phone2FuseOutput::DurationFeatures)?,
            fused_features: get(Phone2FuseOutput::FusedFeatures)?,
            energy: get(Phone2FuseOutput::Energy)?,
        };

        let tokens = outputs.num_tokens();
        for (which, tensor) in Phone2FuseOutput::ALL.iter().zip(outputs.tensors()) {
            if tensor.timesteps() != tokens {
                return Err(TtsError::ShapeMismatch(format!(
                    "{which:?} covers {} tokens, duration target covers {tokens}",
                    tensor.timesteps()
                )));
            }
        }
        Ok(outputs)
    }

    pub fn num_tokens(&self) -> usize {
        self.duration_target.timesteps()
    }

    fn tensors(&self) -> [&'a Tensor2D; 5] {
        [
            self.duration_target,
            self.pitch,
            self.duration_features,
            self.fused_features,
            self.energy,
        ]
    }
}

#[cfg(feature = "onnx")]
pub use onnx::{EngineSpec, OnnxEngine, QuantConfig, TensorSpec};

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use ndarray::Array3;
    use ort::execution_providers::CPUExecutionProvider;
    use ort::inputs;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::TensorRef;
    use serde::Deserialize;

    use super::super::model::TtsError;
    use super::super::quant::QuantParams;
    use super::super::tensor::{Layout, Tensor2D};
    use super::InferenceEngine;

    /// Quantization sidecar (`quant.json`) describing both models' tensors.
    #[derive(Debug, Clone, Deserialize)]
    pub struct QuantConfig {
        pub phone2fuse: EngineSpec,
        pub fuse2mel: EngineSpec,
    }

    impl QuantConfig {
        pub fn load(path: &Path) -> Result<Self, TtsError> {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| TtsError::Config(format!("Failed to parse {}: {e}", path.display())))
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct EngineSpec {
        pub input: TensorSpec,
        pub outputs: Vec<TensorSpec>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct TensorSpec {
        pub name: String,
        pub features: usize,
        pub timesteps: usize,
        #[serde(default)]
        pub time_major: bool,
        #[serde(flatten)]
        pub quant: QuantParams,
    }

    impl TensorSpec {
        fn layout(&self) -> Layout {
            if self.time_major {
                Layout::TimeMajor
            } else {
                Layout::FeatureMajor
            }
        }

        fn empty_tensor(&self) -> Tensor2D {
            Tensor2D::zeros(self.features, self.timesteps, self.layout(), self.quant)
        }

        /// ONNX shape `[1, outer, inner]` matching the tensor's memory order.
        fn onnx_shape(&self) -> (usize, usize, usize) {
            match self.layout() {
                Layout::FeatureMajor => (1, self.features, self.timesteps),
                Layout::TimeMajor => (1, self.timesteps, self.features),
            }
        }
    }

    /// An ONNX model exposed through int16 quantized tensors.
    ///
    /// The graph itself runs in f32; the single input is dequantized before
    /// the run and every output is quantized with its configured parameters.
    pub struct OnnxEngine {
        name: String,
        session: Session,
        input_spec: TensorSpec,
        input: Tensor2D,
        output_specs: Vec<TensorSpec>,
        outputs: Vec<Tensor2D>,
    }

    impl OnnxEngine {
        pub fn load(
            name: &str,
            onnx_path: &Path,
            spec: &EngineSpec,
            num_threads: Option<usize>,
        ) -> Result<Self, TtsError> {
            log::info!("Loading {name} from {}", onnx_path.display());
            let session = init_session(onnx_path, num_threads).map_err(|e| {
                TtsError::Initialization {
                    engine: name.to_string(),
                    reason: e.to_string(),
                }
            })?;

            for expected in std::iter::once(&spec.input).chain(&spec.outputs) {
                let known = session
                    .inputs()
                    .iter()
                    .map(|i| i.name())
                    .chain(session.outputs().iter().map(|o| o.name()))
                    .any(|n| n == expected.name);
                if !known {
                    return Err(TtsError::Initialization {
                        engine: name.to_string(),
                        reason: format!("graph has no tensor named '{}'", expected.name),
                    });
                }
            }

            Ok(Self {
                name: name.to_string(),
                session,
                input: spec.input.empty_tensor(),
                input_spec: spec.input.clone(),
                outputs: spec.outputs.iter().map(TensorSpec::empty_tensor).collect(),
                output_specs: spec.outputs.clone(),
            })
        }
    }

    impl InferenceEngine for OnnxEngine {
        fn name(&self) -> &str {
            &self.name
        }

        fn input(&self, index: usize) -> Result<&Tensor2D, TtsError> {
            match index {
                0 => Ok(&self.input),
                _ => Err(no_tensor(&self.name, "input", index)),
            }
        }

        fn input_mut(&mut self, index: usize) -> Result<&mut Tensor2D, TtsError> {
            match index {
                0 => Ok(&mut self.input),
                _ => Err(no_tensor(&self.name, "input", index)),
            }
        }

        fn invoke(&mut self) -> Result<(), TtsError> {
            let quant = self.input.quant();
            let real: Vec<f32> = self
                .input
                .data()
                .iter()
                .map(|&q| quant.dequantize(q as i32))
                .collect();
            let input_arr = Array3::from_shape_vec(self.input_spec.onnx_shape(), real)?;

            let invocation = |e: ort::Error| TtsError::Invocation {
                engine: self.name.clone(),
                reason: e.to_string(),
            };

            let inputs = inputs![
                self.input_spec.name.as_str() => TensorRef::from_array_view(input_arr.view()).map_err(invocation)?,
            ];
            let results = self.session.run(inputs).map_err(invocation)?;

            for (spec, tensor) in self.output_specs.iter().zip(self.outputs.iter_mut()) {
                let values = results[spec.name.as_str()]
                    .try_extract_array::<f32>()
                    .map_err(invocation)?;
                if values.len() != tensor.data().len() {
                    return Err(TtsError::ShapeMismatch(format!(
                        "{} output '{}' has {} values, expected {}",
                        self.name,
                        spec.name,
                        values.len(),
                        tensor.data().len()
                    )));
                }
                let quant = tensor.quant();
                for (dst, &v) in tensor.data_mut().iter_mut().zip(values.iter()) {
                    *dst = quant.quantize(v);
                }
            }
            Ok(())
        }

        fn output(&self, index: usize) -> Result<&Tensor2D, TtsError> {
            self.outputs
                .get(index)
                .ok_or_else(|| no_tensor(&self.name, "output", index))
        }
    }

    fn no_tensor(engine: &str, kind: &str, index: usize) -> TtsError {
        TtsError::ShapeMismatch(format!("{engine} has no {kind} tensor {index}"))
    }

    fn init_session(onnx_path: &Path, num_threads: Option<usize>) -> Result<Session, ort::Error> {
        let providers = vec![CPUExecutionProvider::default().build()];

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?;

        if let Some(threads) = num_threads {
            builder = builder.with_intra_threads(threads)?;
        }

        builder.commit_from_file(onnx_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::fastspeech::quant::QuantParams;
    use crate::engines::fastspeech::tensor::Layout;

    struct FixedOutputs {
        outputs: Vec<Tensor2D>,
        input: Tensor2D,
    }

    impl InferenceEngine for FixedOutputs {
        fn name(&self) -> &str {
            "fixed"
        }
        fn input(&self, _index: usize) -> Result<&Tensor2D, TtsError> {
            Ok(&self.input)
        }
        fn input_mut(&mut self, _index: usize) -> Result<&mut Tensor2D, TtsError> {
            Ok(&mut self.input)
        }
        fn invoke(&mut self) -> Result<(), TtsError> {
            Ok(())
        }
        fn output(&self, index: usize) -> Result<&Tensor2D, TtsError> {
            self.outputs
                .get(index)
                .ok_or_else(|| TtsError::ShapeMismatch(format!("no output {index}")))
        }
    }

    fn engine_with(tokens: usize, fused_width: usize) -> FixedOutputs {
        let q = QuantParams::new(0.1, 0);
        let outputs = Phone2FuseOutput::ALL
            .iter()
            .map(|w| {
                let width = match w {
                    Phone2FuseOutput::FusedFeatures => fused_width,
                    other => other.width(),
                };
                Tensor2D::zeros(width, tokens, Layout::TimeMajor, q)
            })
            .collect();
        FixedOutputs {
            outputs,
            input: Tensor2D::zeros(1, 1, Layout::TimeMajor, q),
        }
    }

    #[test]
    fn output_indices_are_fixed() {
        assert_eq!(Phone2FuseOutput::DurationTarget.index(), 0);
        assert_eq!(Phone2FuseOutput::Pitch.index(), 1);
        assert_eq!(Phone2FuseOutput::DurationFeatures.index(), 2);
        assert_eq!(Phone2FuseOutput::FusedFeatures.index(), 3);
        assert_eq!(Phone2FuseOutput::Energy.index(), 4);
    }

    #[test]
    fn resolves_outputs_by_name() {
        let engine = engine_with(7, DIM_FEAT);
        let outputs = Phone2FuseOutputs::from_engine(&engine).unwrap();
        assert_eq!(outputs.num_tokens(), 7);
        assert_eq!(outputs.fused_features.features(), DIM_FEAT);
        assert!(std::ptr::eq(outputs.energy, &engine.outputs[4]));
    }

    #[test]
    fn rejects_mis_sized_output() {
        let engine = engine_with(7, 16);
        let err = Phone2FuseOutputs::from_engine(&engine).unwrap_err();
        assert!(matches!(err, TtsError::ShapeMismatch(_)));
    }

    #[test]
    fn boxed_engine_forwards() {
        let boxed: Box<dyn InferenceEngine> = Box::new(engine_with(3, DIM_FEAT));
        assert_eq!(boxed.name(), "fixed");
        assert!(Phone2FuseOutputs::from_engine(&boxed).is_ok());
    }
}
