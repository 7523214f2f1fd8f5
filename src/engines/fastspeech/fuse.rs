//! Bridge between phone2fuse and fuse2mel.
//!
//! For every token one 128-wide frame is assembled from four sources and
//! written as a column of the `[feature, time]` fuse2mel input, then
//! replicated forward in time according to the predicted duration.
//!
//! | rows        | source                                      |
//! |-------------|---------------------------------------------|
//! | `[0, 32)`   | fused features, requantized                 |
//! | `[32, 64)`  | pitch embedding selected by the pitch bin   |
//! | `[64, 96)`  | energy embedding selected by the energy bin |
//! | `[96, 128)` | duration features, requantized              |

use super::inference::Phone2FuseOutputs;
use super::model::{TtsError, DIM_FEAT, DIM_FUSE, WEIGHT_SCALE};
use super::quant::{requantize, requantize_between, QuantParams};
use super::tables::{BinnedEmbedding, EmbeddingTable, FuseTables};
use super::tensor::Tensor2D;

const FUSED_ROWS: usize = 0;
const PITCH_ROWS: usize = DIM_FEAT;
const ENERGY_ROWS: usize = 2 * DIM_FEAT;
const DURATION_ROWS: usize = 3 * DIM_FEAT;

/// Write the token embeddings into the phone2fuse input (`[feature, token]`).
///
/// The network has a fixed token axis, so `tokens` must fill it exactly;
/// shorter sequences are not padded.
pub fn embed_tokens(
    tokens: &[i16],
    table: &EmbeddingTable,
    dst: &mut Tensor2D,
) -> Result<(), TtsError> {
    if tokens.len() != dst.timesteps() || table.dim() != dst.features() {
        return Err(TtsError::ShapeMismatch(format!(
            "{} tokens of width {} do not fit a {}x{} input",
            tokens.len(),
            table.dim(),
            dst.features(),
            dst.timesteps()
        )));
    }

    let out = dst.quant();
    for (position, &id) in tokens.iter().enumerate() {
        let row = usize::try_from(id)
            .ok()
            .and_then(|idx| table.row(idx))
            .ok_or(TtsError::TokenOutOfRange {
                id,
                position,
                rows: table.rows(),
            })?;
        for (feature, &w) in row.iter().enumerate() {
            let q = requantize(w as i32, 0, WEIGHT_SCALE, out.zero_point, out.scale);
            dst.set(feature, position, q);
        }
    }
    Ok(())
}

/// Assemble the frame of `token` into column `column` of `dst`.
///
/// `column` must be below `dst.timesteps()`; that is the caller's job.
pub fn fuse_frame(
    sources: &Phone2FuseOutputs<'_>,
    tables: &FuseTables,
    token: usize,
    dst: &mut Tensor2D,
    column: usize,
) {
    let out = dst.quant();
    copy_requantized(sources.fused_features, token, dst, FUSED_ROWS, column);
    write_embedding(sources.pitch, &tables.pitch, token, out, dst, PITCH_ROWS, column);
    write_embedding(sources.energy, &tables.energy, token, out, dst, ENERGY_ROWS, column);
    copy_requantized(sources.duration_features, token, dst, DURATION_ROWS, column);
}

fn copy_requantized(src: &Tensor2D, token: usize, dst: &mut Tensor2D, row0: usize, column: usize) {
    let (from, to) = (src.quant(), dst.quant());
    for j in 0..src.features() {
        let q = requantize_between(src.at(j, token), from, to);
        dst.set(row0 + j, column, q);
    }
}

fn write_embedding(
    prediction: &Tensor2D,
    table: &BinnedEmbedding,
    token: usize,
    out: QuantParams,
    dst: &mut Tensor2D,
    row0: usize,
    column: usize,
) {
    let value = prediction.real_at(0, token);
    let (_bin, row) = table.lookup(value);
    for (j, &w) in row.iter().enumerate() {
        let q = requantize(w as i32, 0, WEIGHT_SCALE, out.zero_point, out.scale);
        dst.set(row0 + j, column, q);
    }
}

/// Predicted number of frames for `token`, rounded and floored at zero.
pub fn decode_repeat(duration_target: &Tensor2D, token: usize) -> usize {
    let value = duration_target.real_at(0, token).round();
    if value.is_nan() || value < 0.0 {
        log::warn!("token {token}: duration {value} clamped to 0");
        return 0;
    }
    value as usize
}

/// Write cursor over the time axis of the fuse2mel input.
#[derive(Debug, Clone)]
pub struct DurationExpander {
    position: usize,
    capacity: usize,
}

impl DurationExpander {
    pub fn new(capacity: usize) -> Self {
        Self {
            position: 0,
            capacity,
        }
    }

    /// Column the next token's frame goes to.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `repeat` more frames still fit.
    pub fn fits(&self, repeat: usize) -> bool {
        self.position + repeat <= self.capacity
    }

    /// Replicate the frame at the cursor `repeat - 1` times and move past it.
    ///
    /// With `repeat == 0` the cursor stays put, so the next token overwrites
    /// the current column.
    pub fn expand(&mut self, dst: &mut Tensor2D, repeat: usize) -> Result<(), TtsError> {
        if !self.fits(repeat) {
            return Err(TtsError::DurationOverflow {
                needed: self.position + repeat,
                capacity: self.capacity,
            });
        }
        for r in 1..repeat {
            dst.copy_column(self.position, self.position + r);
        }
        self.position += repeat;
        Ok(())
    }
}

/// Build the complete fuse2mel input; returns the number of frames written.
///
/// `dst` must already hold the zero point everywhere. Fails without
/// truncating when the durations add up to more than `dst.timesteps()`.
pub fn fuse_and_expand(
    sources: &Phone2FuseOutputs<'_>,
    tables: &FuseTables,
    dst: &mut Tensor2D,
) -> Result<usize, TtsError> {
    if dst.features() != DIM_FUSE {
        return Err(TtsError::ShapeMismatch(format!(
            "fuse2mel input has {} features, expected {DIM_FUSE}",
            dst.features()
        )));
    }

    let mut expander = DurationExpander::new(dst.timesteps());
    for token in 0..sources.num_tokens() {
        let repeat = decode_repeat(sources.duration_target, token);
        // A full tensor can still take zero-length tokens; they have no column to land in.
        if expander.position() < expander.capacity() {
            fuse_frame(sources, tables, token, dst, expander.position());
        }
        expander.expand(dst, repeat)?;
    }
    Ok(expander.position())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::fastspeech::model::{NUM_FFT_BINS, NUM_MELS, TIMESTEPS};
    use crate::engines::fastspeech::tables::MelInverse;
    use crate::engines::fastspeech::tensor::Layout;

    const OUT: QuantParams = QuantParams::new(1.0 / 256.0, 0);

    struct Sources {
        duration_target: Tensor2D,
        pitch: Tensor2D,
        duration_features: Tensor2D,
        fused_features: Tensor2D,
        energy: Tensor2D,
    }

    impl Sources {
        fn new(durations: &[f32]) -> Self {
            let n = durations.len();
            let scalar = QuantParams::new(0.01, 0);
            let mut duration_target = Tensor2D::zeros(1, n, Layout::TimeMajor, scalar);
            for (i, &d) in durations.iter().enumerate() {
                duration_target.set(0, i, scalar.quantize(d));
            }
            let feat = QuantParams::new(1.0 / 128.0, 2);
            let mut fused_features = Tensor2D::zeros(DIM_FEAT, n, Layout::TimeMajor, feat);
            let mut duration_features = Tensor2D::zeros(DIM_FEAT, n, Layout::TimeMajor, feat);
            for t in 0..n {
                for f in 0..DIM_FEAT {
                    fused_features.set(f, t, (t * 100 + f) as i16);
                    duration_features.set(f, t, -((t * 100 + f) as i16));
                }
            }
            Self {
                duration_target,
                pitch: Tensor2D::zeros(1, n, Layout::TimeMajor, scalar),
                duration_features,
                fused_features,
                energy: Tensor2D::zeros(1, n, Layout::TimeMajor, scalar),
            }
        }

        fn outputs(&self) -> Phone2FuseOutputs<'_> {
            Phone2FuseOutputs {
                duration_target: &self.duration_target,
                pitch: &self.pitch,
                duration_features: &self.duration_features,
                fused_features: &self.fused_features,
                energy: &self.energy,
            }
        }
    }

    fn tables() -> FuseTables {
        // row r of both embeddings is filled with r * 64, i.e. r / 32 in Q11
        let rows = |n: usize| -> Vec<i16> {
            (0..n).flat_map(|r| vec![(r as i16) * 64; DIM_FEAT]).collect()
        };
        let pitch = BinnedEmbedding::new(
            EmbeddingTable::new(rows(4), DIM_FEAT).unwrap(),
            vec![-1.0, 0.0, 1.0],
        )
        .unwrap();
        let energy = BinnedEmbedding::new(
            EmbeddingTable::new(rows(3), DIM_FEAT).unwrap(),
            vec![0.5, 2.0],
        )
        .unwrap();
        FuseTables::new(
            EmbeddingTable::new((0..4 * 128).map(|v| v as i16).collect(), 128).unwrap(),
            pitch,
            energy,
            MelInverse::new(vec![0.0; NUM_FFT_BINS * NUM_MELS]).unwrap(),
        )
        .unwrap()
    }

    fn fuse_input() -> Tensor2D {
        Tensor2D::zeros(DIM_FUSE, TIMESTEPS, Layout::FeatureMajor, OUT)
    }

    #[test]
    fn frame_rows_come_from_the_four_sources() {
        let mut src = Sources::new(&[1.0]);
        src.pitch.set(0, 0, src.pitch.quant().quantize(0.5)); // bin 2
        src.energy.set(0, 0, src.energy.quant().quantize(3.0)); // bin 2
        let tables = tables();
        let mut dst = fuse_input();

        fuse_frame(&src.outputs(), &tables, 0, &mut dst, 5);

        let feat = src.fused_features.quant();
        assert_eq!(dst.at(3, 5), requantize_between(3, feat, OUT));
        // 2 * 64 in Q11 is 1/16, i.e. 16 in the 1/256 output domain
        assert_eq!(dst.at(PITCH_ROWS, 5), 16);
        assert_eq!(dst.at(ENERGY_ROWS + 31, 5), 16);
        assert_eq!(dst.at(DURATION_ROWS + 3, 5), requantize_between(-3, feat, OUT));
        // neighbours untouched
        assert_eq!(dst.at(3, 4), 0);
        assert_eq!(dst.at(3, 6), 0);
    }

    #[test]
    fn expansion_ends_at_the_sum_of_durations() {
        let durations = [2.0, 0.0, 3.4, 1.0, 0.6];
        let src = Sources::new(&durations);
        let mut dst = fuse_input();
        let frames = fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap();
        // 2 + 0 + 3 + 1 + 1
        assert_eq!(frames, 7);
    }

    #[test]
    fn repeated_columns_are_copies() {
        let src = Sources::new(&[3.0, 2.0]);
        let mut dst = fuse_input();
        fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap();
        for f in 0..DIM_FUSE {
            assert_eq!(dst.at(f, 0), dst.at(f, 1));
            assert_eq!(dst.at(f, 0), dst.at(f, 2));
            assert_eq!(dst.at(f, 3), dst.at(f, 4));
        }
        assert_ne!(dst.at(0, 2), dst.at(0, 3));
        // past the last frame the tensor still holds the zero point
        assert!((5..TIMESTEPS).all(|t| dst.at(0, t) == 0));
    }

    #[test]
    fn zero_duration_token_is_overwritten_by_the_next() {
        let src = Sources::new(&[0.0, 1.0]);
        let mut dst = fuse_input();
        let frames = fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap();
        assert_eq!(frames, 1);
        let feat = src.fused_features.quant();
        assert_eq!(dst.at(1, 0), requantize_between(101, feat, OUT));
    }

    #[test]
    fn trailing_zero_duration_leaves_an_orphan_column() {
        let src = Sources::new(&[1.0, 0.0]);
        let mut dst = fuse_input();
        let frames = fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap();
        assert_eq!(frames, 1);
        let feat = src.fused_features.quant();
        assert_eq!(dst.at(1, 1), requantize_between(101, feat, OUT));
    }

    #[test]
    fn negative_duration_counts_as_zero() {
        let src = Sources::new(&[-2.0, 1.0]);
        let mut dst = fuse_input();
        assert_eq!(fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap(), 1);
    }

    #[test]
    fn overflowing_durations_fail() {
        let src = Sources::new(&[200.0, 101.0]);
        let mut dst = fuse_input();
        let err = fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap_err();
        assert!(matches!(
            err,
            TtsError::DurationOverflow {
                needed: 301,
                capacity: TIMESTEPS
            }
        ));
    }

    #[test]
    fn exactly_full_tensor_is_accepted() {
        let src = Sources::new(&[200.0, 100.0, 0.0]);
        let mut dst = fuse_input();
        assert_eq!(
            fuse_and_expand(&src.outputs(), &tables(), &mut dst).unwrap(),
            TIMESTEPS
        );
    }

    #[test]
    fn expander_tracks_position() {
        let mut dst = Tensor2D::zeros(2, 10, Layout::FeatureMajor, OUT);
        let mut exp = DurationExpander::new(10);
        dst.set(0, 0, 9);
        exp.expand(&mut dst, 4).unwrap();
        assert_eq!(exp.position(), 4);
        assert_eq!(dst.at(0, 3), 9);
        assert!(exp.expand(&mut dst, 7).is_err());
        assert_eq!(exp.position(), 4);
        exp.expand(&mut dst, 6).unwrap();
        assert_eq!(exp.position(), 10);
    }

    #[test]
    fn token_embedding_is_transposed() {
        let tables = tables();
        let q = QuantParams::new(1.0 / 2048.0, 0);
        let mut dst = Tensor2D::zeros(128, 3, Layout::FeatureMajor, q);
        embed_tokens(&[2, 0, 3], &tables.input_embed, &mut dst).unwrap();
        // identical scales: raw weights pass through
        assert_eq!(dst.at(5, 0), 2 * 128 + 5);
        assert_eq!(dst.at(127, 2), 3 * 128 + 127);
        assert_eq!(dst.data()[5 * 3], 2 * 128 + 5);
    }

    #[test]
    fn token_outside_table_is_rejected() {
        let tables = tables();
        let q = QuantParams::new(1.0 / 2048.0, 0);
        let mut dst = Tensor2D::zeros(128, 2, Layout::FeatureMajor, q);
        let err = embed_tokens(&[1, 4], &tables.input_embed, &mut dst).unwrap_err();
        assert!(matches!(
            err,
            TtsError::TokenOutOfRange { id: 4, position: 1, rows: 4 }
        ));
        assert!(embed_tokens(&[-1, 0], &tables.input_embed, &mut dst).is_err());
        assert!(embed_tokens(&[0], &tables.input_embed, &mut dst).is_err());
    }
}
