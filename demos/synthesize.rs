use std::path::PathBuf;
use std::time::Instant;

use quant_tts::{
    engines::fastspeech::{
        FastSpeechEngine, FastSpeechInferenceParams, FastSpeechModelParams, GriffinLimConfig,
        PhaseInit, REFERENCE_TOKENS,
    },
    SynthesisEngine,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut engine = FastSpeechEngine::new();
    let model_path = PathBuf::from("models/fastspeech");

    let load_start = Instant::now();
    engine.load_model_with_params(&model_path, FastSpeechModelParams::default())?;
    println!("Models loaded in {:.2?}", load_start.elapsed());

    let params = FastSpeechInferenceParams {
        griffin_lim: GriffinLimConfig::builder()
            .phase_init(PhaseInit::Random { seed: 1 })
            .build()?,
    };

    let synth_start = Instant::now();
    let result = engine.synthesize(&REFERENCE_TOKENS, Some(params))?;
    let synth_dur = synth_start.elapsed();

    let speedup = result.duration_secs() / synth_dur.as_secs_f64();
    println!(
        "Synthesized {:.2}s audio in {:.2?} ({:.1}x real-time)",
        result.duration_secs(),
        synth_dur,
        speedup
    );
    println!("First samples: {:?}", &result.samples[..10.min(result.samples.len())]);

    result.write_wav(&PathBuf::from("output.wav"))?;
    println!("Saved to output.wav");

    engine.unload_model();
    Ok(())
}
