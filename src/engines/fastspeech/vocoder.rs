//! Griffin-Lim phase reconstruction.
//!
//! Spectra are kept in Q15 sample units (a real magnitude of 1.0 becomes
//! [`SPEC_UPSCALE`]) and the waveform is overlap-added into an `i32`
//! accumulator, then saturated to PCM16 once all iterations are done.

use std::f32::consts::PI;
use std::sync::Arc;

use derive_builder::Builder;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use super::model::{
    TtsError, FFT_SIZE, HOP_SIZE, ITERS_GRIFFIN_LIN, NUM_FFT_BINS, NUM_MELS, SPEC_UPSCALE,
    WINDOW_SIZE,
};
use super::tables::MelInverse;
use super::tensor::Tensor2D;

/// Squared-window envelope below this is treated as this value.
const ENVELOPE_FLOOR: f32 = 1e-3;

/// Guards the phase normalisation of silent bins.
const MAG_EPSILON: f32 = 1e-10;

/// How the phase of the first synthesis pass is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseInit {
    /// Every bin starts at phase 0.
    Zero,
    /// Uniform phases from a PCG32 stream; DC and Nyquist stay at 0.
    Random { seed: u64 },
}

/// Griffin-Lim settings.
///
/// `phase_init` has no default: reproducibility of the output depends on it,
/// so callers always choose it.
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(error = "TtsError"))]
pub struct GriffinLimConfig {
    #[builder(default = "ITERS_GRIFFIN_LIN")]
    pub iterations: usize,
    pub phase_init: PhaseInit,
}

impl GriffinLimConfig {
    pub fn builder() -> GriffinLimConfigBuilder {
        GriffinLimConfigBuilder::default()
    }
}

/// Magnitude spectrogram, `[frame][bin]` with `NUM_FFT_BINS` bins per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    frames: usize,
    data: Vec<f32>,
}

impl Spectrogram {
    pub fn new(frames: usize, data: Vec<f32>) -> Result<Self, TtsError> {
        if data.len() != frames * NUM_FFT_BINS {
            return Err(TtsError::ShapeMismatch(format!(
                "{} magnitudes do not form {frames} frames of {NUM_FFT_BINS} bins",
                data.len()
            )));
        }
        Ok(Self { frames, data })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn frame(&self, t: usize) -> &[f32] {
        &self.data[t * NUM_FFT_BINS..(t + 1) * NUM_FFT_BINS]
    }
}

/// Expand the first `frames` log-mel frames into linear magnitudes.
///
/// `mel` is the fuse2mel output, one column of `NUM_MELS` features per frame.
pub fn mel_to_linear(
    mel: &Tensor2D,
    frames: usize,
    mel_inverse: &MelInverse,
) -> Result<Spectrogram, TtsError> {
    if mel.features() != NUM_MELS || frames > mel.timesteps() {
        return Err(TtsError::ShapeMismatch(format!(
            "cannot take {frames} frames of {NUM_MELS} mels from a {}x{} tensor",
            mel.features(),
            mel.timesteps()
        )));
    }

    let mut data = Vec::with_capacity(frames * NUM_FFT_BINS);
    let mut energies = [0f32; NUM_MELS];
    for t in 0..frames {
        for (k, e) in energies.iter_mut().enumerate() {
            *e = mel.real_at(k, t).exp();
        }
        for j in 0..NUM_FFT_BINS {
            let mag: f32 = mel_inverse
                .row(j)
                .iter()
                .zip(&energies)
                .map(|(w, e)| w * e)
                .sum();
            data.push(mag);
        }
    }
    Spectrogram::new(frames, data)
}

/// Overlap-added waveform in Q15 sample units.
#[derive(Debug, Clone)]
pub struct Waveform {
    accumulator: Vec<i32>,
    frames: usize,
}

impl Waveform {
    fn zeros(frames: usize) -> Self {
        Self {
            accumulator: vec![0; ola_len(frames)],
            frames,
        }
    }

    /// Full accumulator, `(frames - 1) * HOP_SIZE + WINDOW_SIZE` samples.
    pub fn accumulator(&self) -> &[i32] {
        &self.accumulator
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// First `frames * HOP_SIZE` samples saturated to PCM16.
    pub fn to_pcm16(&self) -> Vec<i16> {
        let samples = &self.accumulator[..self.frames * HOP_SIZE];
        let clipped = samples
            .iter()
            .filter(|&&s| s < i16::MIN as i32 || s > i16::MAX as i32)
            .count();
        if clipped > 0 {
            log::warn!("{clipped} of {} samples clipped to PCM16", samples.len());
        }
        samples
            .iter()
            .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect()
    }
}

fn ola_len(frames: usize) -> usize {
    (frames - 1) * HOP_SIZE + WINDOW_SIZE
}

/// Windowed FFT analysis and synthesis for one frame at a time.
pub struct Stft {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl Default for Stft {
    fn default() -> Self {
        Self::new()
    }
}

impl Stft {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let ifft = planner.plan_fft_inverse(FFT_SIZE);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        Self {
            fft,
            ifft,
            window: hann_window(WINDOW_SIZE),
            buffer: vec![Complex32::new(0.0, 0.0); FFT_SIZE],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn window(&self) -> &[f32] {
        &self.window
    }

    /// Spectrum of `WINDOW_SIZE` samples starting at `segment[0]`.
    pub fn analyze(&mut self, segment: &[i32], spectrum: &mut [Complex32]) {
        self.buffer.fill(Complex32::new(0.0, 0.0));
        for ((b, &x), &w) in self.buffer.iter_mut().zip(segment).zip(&self.window) {
            b.re = x as f32 * w;
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
        spectrum.copy_from_slice(&self.buffer[..NUM_FFT_BINS]);
    }

    /// Windowed inverse transform of a one-sided spectrum.
    pub fn synthesize(&mut self, spectrum: &[Complex32], frame: &mut [f32]) {
        self.buffer[..NUM_FFT_BINS].copy_from_slice(spectrum);
        // DC and Nyquist of a real signal have no imaginary part
        self.buffer[0].im = 0.0;
        self.buffer[NUM_FFT_BINS - 1].im = 0.0;
        for k in 1..NUM_FFT_BINS - 1 {
            self.buffer[FFT_SIZE - k] = spectrum[k].conj();
        }
        self.ifft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
        let norm = 1.0 / FFT_SIZE as f32;
        for ((y, b), &w) in frame.iter_mut().zip(&self.buffer).zip(&self.window) {
            *y = b.re * norm * w;
        }
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / len as f32).cos())
        .collect()
}

/// Iterative magnitude-only spectrogram inversion.
pub struct GriffinLim {
    config: GriffinLimConfig,
    stft: Stft,
}

impl GriffinLim {
    pub fn new(config: GriffinLimConfig) -> Self {
        Self {
            config,
            stft: Stft::new(),
        }
    }

    pub fn reconstruct(&mut self, target: &Spectrogram) -> Result<Waveform, TtsError> {
        self.reconstruct_with_trace(target).map(|(wave, _)| wave)
    }

    /// Like [`reconstruct`](Self::reconstruct), also returning the relative
    /// spectral distance of the waveform synthesized in each iteration.
    pub fn reconstruct_with_trace(
        &mut self,
        target: &Spectrogram,
    ) -> Result<(Waveform, Vec<f32>), TtsError> {
        let frames = target.frames();
        if frames == 0 {
            return Err(TtsError::InvalidFrameCount(frames));
        }

        let envelope = self.envelope(frames);
        let mut spectra = self.initial_spectra(target);
        let mut wave = Waveform::zeros(frames);
        let mut trace = Vec::with_capacity(self.config.iterations);
        let mut frame_spec = vec![Complex32::new(0.0, 0.0); NUM_FFT_BINS];

        let target_norm = target.data.iter().map(|a| a * a).sum::<f32>().sqrt();

        for iter in 0..self.config.iterations {
            self.overlap_add(&spectra, &envelope, &mut wave);

            let mut err = 0f32;
            for t in 0..frames {
                let start = t * HOP_SIZE;
                self.stft
                    .analyze(&wave.accumulator[start..start + WINDOW_SIZE], &mut frame_spec);
                let mags = target.frame(t);
                let dst = &mut spectra[t * NUM_FFT_BINS..(t + 1) * NUM_FFT_BINS];
                for ((s, &x), &a) in dst.iter_mut().zip(&frame_spec).zip(mags) {
                    let norm = x.norm();
                    let diff = norm / SPEC_UPSCALE - a;
                    err += diff * diff;
                    *s = x / (norm + MAG_EPSILON) * (a * SPEC_UPSCALE);
                }
            }

            let distance = if target_norm > 0.0 {
                err.sqrt() / target_norm
            } else {
                err.sqrt()
            };
            log::debug!("griffin-lim iteration {iter}: spectral distance {distance:.5}");
            trace.push(distance);
        }

        self.overlap_add(&spectra, &envelope, &mut wave);
        Ok((wave, trace))
    }

    fn initial_spectra(&self, target: &Spectrogram) -> Vec<Complex32> {
        let mut rng = match self.config.phase_init {
            PhaseInit::Random { seed } => Some(Pcg32::seed_from_u64(seed)),
            PhaseInit::Zero => None,
        };

        let mut spectra = Vec::with_capacity(target.data.len());
        for t in 0..target.frames() {
            for (j, &mag) in target.frame(t).iter().enumerate() {
                let phase = match rng.as_mut() {
                    Some(rng) if j != 0 && j != NUM_FFT_BINS - 1 => rng.gen::<f32>() * 2.0 * PI,
                    _ => 0.0,
                };
                spectra.push(Complex32::from_polar(mag * SPEC_UPSCALE, phase));
            }
        }
        spectra
    }

    /// Sum of squared synthesis windows over all frames, floored.
    fn envelope(&self, frames: usize) -> Vec<f32> {
        let mut env = vec![0f32; ola_len(frames)];
        let window = self.stft.window();
        for t in 0..frames {
            let start = t * HOP_SIZE;
            for (e, &w) in env[start..start + WINDOW_SIZE].iter_mut().zip(window) {
                *e += w * w;
            }
        }
        for e in &mut env {
            *e = e.max(ENVELOPE_FLOOR);
        }
        env
    }

    /// Least-squares inverse STFT of `spectra` into `wave`.
    fn overlap_add(&mut self, spectra: &[Complex32], envelope: &[f32], wave: &mut Waveform) {
        wave.accumulator.fill(0);
        let mut frame = vec![0f32; WINDOW_SIZE];
        for t in 0..wave.frames {
            self.stft
                .synthesize(&spectra[t * NUM_FFT_BINS..(t + 1) * NUM_FFT_BINS], &mut frame);
            let start = t * HOP_SIZE;
            let acc = &mut wave.accumulator[start..start + WINDOW_SIZE];
            for ((s, &y), &e) in acc.iter_mut().zip(&frame).zip(&envelope[start..]) {
                *s = s.saturating_add((y / e).round() as i32);
            }
        }
    }
}
