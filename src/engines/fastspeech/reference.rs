//! Comparison of pipeline buffers against bundled reference arrays.

use std::path::Path;

use super::inference::Phone2FuseOutput;
use super::model::TtsError;
use super::tables::read_npz;

/// Number of leading (output, reference) pairs written to the debug log.
const LOGGED_PAIRS: usize = 10;

/// Golden int16 arrays recorded from a known-good run of [`REFERENCE_TOKENS`].
///
/// Every entry is optional; checks are only run for the arrays present.
/// Tensors are stored raw, in the memory layout of the engine tensor they
/// are compared with.
///
/// [`REFERENCE_TOKENS`]: super::model::REFERENCE_TOKENS
#[derive(Debug, Clone, Default)]
pub struct ReferenceArrays {
    pub phone2fuse_input: Option<Vec<i16>>,
    pub phone2fuse_outputs: Vec<(Phone2FuseOutput, Vec<i16>)>,
    pub fuse2mel_input: Option<Vec<i16>>,
    pub fuse2mel_output: Option<Vec<i16>>,
    /// Leading PCM16 samples of the synthesized waveform.
    pub waveform: Option<Vec<i16>>,
}

impl ReferenceArrays {
    /// Load from a `.npz` archive.
    ///
    /// Recognised entries: `p2f_input`, `p2f_<output>` for every phone2fuse
    /// output (`p2f_duration_target`, `p2f_pitch`, `p2f_duration_features`,
    /// `p2f_fused_features`, `p2f_energy`), `f2m_input`, `f2m_output` and
    /// `waveform`. Other entries are ignored.
    pub fn load(path: &Path) -> Result<Self, TtsError> {
        let mut arrays = read_npz(path)?;
        let mut take = |name: &str| {
            arrays
                .remove(name)
                .map(|data| data.into_i16(name))
                .transpose()
        };

        let mut phone2fuse_outputs = Vec::new();
        for which in Phone2FuseOutput::ALL {
            if let Some(values) = take(&format!("p2f_{}", which.name()))? {
                phone2fuse_outputs.push((which, values));
            }
        }

        let reference = Self {
            phone2fuse_input: take("p2f_input")?,
            phone2fuse_outputs,
            fuse2mel_input: take("f2m_input")?,
            fuse2mel_output: take("f2m_output")?,
            waveform: take("waveform")?,
        };
        log::info!(
            "Loaded reference arrays from {} ({} phone2fuse outputs)",
            path.display(),
            reference.phone2fuse_outputs.len()
        );
        Ok(reference)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceReport {
    pub name: String,
    pub compared: usize,
    pub mismatches: usize,
    pub max_abs_error: i64,
    pub tolerance: i64,
}

impl ReferenceReport {
    /// Element-wise comparison over the common prefix of both buffers.
    ///
    /// A length difference counts every missing element as a mismatch.
    pub fn compare<T>(name: &str, output: &[T], reference: &[T], tolerance: i64) -> Self
    where
        T: Copy + Into<i64>,
    {
        let mut mismatches = output.len().abs_diff(reference.len());
        let mut max_abs_error = 0i64;

        for (i, (&out, &exp)) in output.iter().zip(reference).enumerate() {
            let (out, exp): (i64, i64) = (out.into(), exp.into());
            if i < LOGGED_PAIRS {
                log::debug!("{name}[{i}] (out,ref)=({out},{exp})");
            }
            let err = (out - exp).abs();
            max_abs_error = max_abs_error.max(err);
            if err > tolerance {
                mismatches += 1;
            }
        }

        Self {
            name: name.to_string(),
            compared: output.len().min(reference.len()),
            mismatches,
            max_abs_error,
            tolerance,
        }
    }

    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    pub fn ensure(self) -> Result<Self, TtsError> {
        if self.passed() {
            log::info!(
                "{} matches reference ({} values, max error {})",
                self.name,
                self.compared,
                self.max_abs_error
            );
            Ok(self)
        } else {
            Err(TtsError::ReferenceMismatch {
                name: self.name,
                mismatches: self.mismatches,
                max_abs_error: self.max_abs_error,
            })
        }
    }
}
