//! Headless demo: two emitters on the software backend.
//!
//! Run with `RUST_LOG=debug` to see per-frame pipeline logs.

use std::process::ExitCode;

use ssfx::prelude::*;
use ssfx::spline::SplinePoint;

const FRAMES: u32 = 120;
const DELTA: f32 = 1.0 / 60.0;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> ssfx::Result<()> {
    let settings = PipelineSettings::new()
        .with_emitter(EmitterSlot::new(256))
        .with_emitter(EmitterSlot::new(64))
        .with_policy(MergePolicy::PrioritizeNew)
        .with_wind(Vec3::X, 0.5)
        .with_debug(true);

    let mut backend = SoftwareBackend::new();
    let mut context = EffectContext::new();
    let mut pipeline = ParticleBufferPipeline::new(settings);
    let mut clock = FrameClock::new();
    clock.set_fixed_delta(Some(DELTA));

    let path = SplinePath::new()
        .with_point(SplinePoint::new(Vec3::ZERO, Vec3::new(0.0, 1.0, 0.0), 0.3))
        .with_point(SplinePoint::new(Vec3::new(2.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 0.0), 0.3));
    let path_id = context.splines_mut().register(path);
    log::info!("registered path {:?}", path_id);

    let mut fountain = ParticleEffect::new(EmitterParams::new().with_gravity(1.0))
        .with_duration(1.5)
        .with_emission(EmissionSettings {
            spawn_rate: 240.0,
            lifetime_min: 0.5,
            lifetime_max: 1.0,
            ..Default::default()
        });
    let mut sparks = ParticleEffect::new(EmitterParams::new()).with_emission(EmissionSettings {
        spawn_rate: 60.0,
        ..Default::default()
    });
    fountain.start(context.configs_mut(), None);
    sparks.start(context.configs_mut(), Some(2.0));

    let mut seed = 1u32;
    for _ in 0..FRAMES {
        clock.update();
        fountain.update(clock.delta());
        sparks.update(clock.delta());
        let spawns = [fountain.spawn_count(clock.delta()), sparks.spawn_count(clock.delta())];

        pipeline.run_frame(&mut backend, &mut context, clock.elapsed(), clock.delta(), |backend, target| {
            for (emitter, (effect, count)) in [&fountain, &sparks].into_iter().zip(spawns).enumerate() {
                for _ in 0..count {
                    let jitter = Vec3::new(next(&mut seed), next(&mut seed), next(&mut seed));
                    let normal = Vec3::new(next(&mut seed) - 0.5, 1.0, next(&mut seed) - 0.5);
                    let particle = effect.make_particle(Vec3::ZERO, normal, target.time, jitter);
                    backend.emit(target, emitter as u32, particle)?;
                }
            }
            Ok(())
        })?;

        if clock.frame() % 30 == 0 {
            let live = pipeline.read_live_counts(&mut backend)?;
            log::info!("frame {}: live particles per emitter {:?}", clock.frame(), live);
        }
    }

    pipeline.free_resources(&mut backend, &mut context);
    log::info!("done, {} buffers still live", backend.live_buffers());
    Ok(())
}

fn next(seed: &mut u32) -> f32 {
    *seed ^= *seed << 13;
    *seed ^= *seed >> 17;
    *seed ^= *seed << 5;
    (*seed >> 8) as f32 / (1u32 << 24) as f32
}
