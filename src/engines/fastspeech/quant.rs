//! Fixed-point helpers shared by every stage of the pipeline.
//!
//! All conversions between quantized domains go through [`requantize`], so
//! the round/clamp policy lives in exactly one place.

use serde::Deserialize;

/// Scale and zero point of a quantized tensor.
///
/// A raw value `q` represents the real number `(q - zero_point) * scale`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub const fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    /// Real value of a raw sample in this domain.
    pub fn dequantize(&self, raw: i32) -> f32 {
        dequantize(raw, self.zero_point, self.scale)
    }

    /// Nearest raw sample for a real value, saturated to i16.
    pub fn quantize(&self, real: f32) -> i16 {
        quantize(real, self.zero_point, self.scale)
    }
}

pub fn dequantize(raw: i32, zero: i32, scale: f32) -> f32 {
    (raw - zero) as f32 * scale
}

/// Round-half-away-from-zero quantization with i16 saturation.
pub fn quantize(real: f32, zero: i32, scale: f32) -> i16 {
    let q = (real / scale).round() + zero as f32;
    // NaN maps to the zero point rather than to 0
    if q.is_nan() {
        return zero.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
    q.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Move a raw value from one quantized domain into another.
///
/// Values that fall outside the i16 range of the destination domain are
/// clamped; this is a lossy but expected outcome, not an error.
pub fn requantize(raw: i32, src_zero: i32, src_scale: f32, dst_zero: i32, dst_scale: f32) -> i16 {
    quantize(dequantize(raw, src_zero, src_scale), dst_zero, dst_scale)
}

/// Same as [`requantize`] but with both domains given as [`QuantParams`].
pub fn requantize_between(raw: i16, src: QuantParams, dst: QuantParams) -> i16 {
    requantize(raw as i32, src.zero_point, src.scale, dst.zero_point, dst.scale)
}

/// Index of the half-open bin `value` falls into.
///
/// `bins` holds the `num_embeds - 1` ascending upper boundaries. Returns the
/// first `b` with `value < bins[b]`, or `num_embeds - 1` when there is none.
/// `bins` must be non-decreasing; this is not re-checked here.
pub fn find_bin(num_embeds: usize, bins: &[f32], value: f32) -> usize {
    let last = num_embeds.saturating_sub(1);
    // NaN compares false against every boundary
    if value.is_nan() {
        return last;
    }
    let bounds = &bins[..last.min(bins.len())];
    // First boundary strictly greater than `value`.
    bounds.partition_point(|&b| b <= value).min(last)
}

/// Row `bin_index` of a row-major `[rows, dim]` embedding table.
pub fn embed_lookup(table: &[i16], bin_index: usize, dim: usize) -> &[i16] {
    let start = bin_index * dim;
    &table[start..start + dim]
}
