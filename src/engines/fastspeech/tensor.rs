//! Quantized 2-D tensors with an explicit memory layout.
//!
//! Every component addresses tensor elements through [`Tensor2D::at`] /
//! [`Tensor2D::set`] so the transpose convention is encoded once.

use super::model::TtsError;
use super::quant::QuantParams;

/// Memory order of a [`Tensor2D`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `[feature, time]`: element `(f, t)` lives at `f * timesteps + t`.
    FeatureMajor,
    /// `[time, feature]`: element `(f, t)` lives at `t * features + f`.
    TimeMajor,
}

/// An i16 buffer of shape `features x timesteps` in a fixed quantized domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor2D {
    data: Vec<i16>,
    features: usize,
    timesteps: usize,
    layout: Layout,
    quant: QuantParams,
}

impl Tensor2D {
    /// A tensor filled with the raw value of real zero (the zero point).
    pub fn zeros(features: usize, timesteps: usize, layout: Layout, quant: QuantParams) -> Self {
        let fill = quant.zero_point.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        Self {
            data: vec![fill; features * timesteps],
            features,
            timesteps,
            layout,
            quant,
        }
    }

    pub fn from_vec(
        data: Vec<i16>,
        features: usize,
        timesteps: usize,
        layout: Layout,
        quant: QuantParams,
    ) -> Result<Self, TtsError> {
        if data.len() != features * timesteps {
            return Err(TtsError::ShapeMismatch(format!(
                "buffer of {} elements cannot hold {features}x{timesteps}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            features,
            timesteps,
            layout,
            quant,
        })
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn quant(&self) -> QuantParams {
        self.quant
    }

    pub fn data(&self) -> &[i16] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [i16] {
        &mut self.data
    }

    #[inline]
    fn offset(&self, feature: usize, time: usize) -> usize {
        debug_assert!(feature < self.features && time < self.timesteps);
        match self.layout {
            Layout::FeatureMajor => feature * self.timesteps + time,
            Layout::TimeMajor => time * self.features + feature,
        }
    }

    #[inline]
    pub fn at(&self, feature: usize, time: usize) -> i16 {
        self.data[self.offset(feature, time)]
    }

    #[inline]
    pub fn set(&mut self, feature: usize, time: usize, value: i16) {
        let idx = self.offset(feature, time);
        self.data[idx] = value;
    }

    /// Real value of element `(feature, time)`.
    pub fn real_at(&self, feature: usize, time: usize) -> f32 {
        self.quant.dequantize(self.at(feature, time) as i32)
    }

    /// Copy every feature of column `src` into column `dst`.
    pub fn copy_column(&mut self, src: usize, dst: usize) {
        for f in 0..self.features {
            let v = self.at(f, src);
            self.set(f, dst, v);
        }
    }

    /// Overwrite the buffer with raw values already in this tensor's layout.
    pub fn load_raw(&mut self, raw: &[i16]) -> Result<(), TtsError> {
        if raw.len() != self.data.len() {
            return Err(TtsError::ShapeMismatch(format!(
                "{} raw values for a {}x{} tensor",
                raw.len(),
                self.features,
                self.timesteps
            )));
        }
        self.data.copy_from_slice(raw);
        Ok(())
    }

    /// Reset every element to the zero point.
    pub fn clear(&mut self) {
        let fill = self.quant.zero_point.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        self.data.fill(fill);
    }

}
