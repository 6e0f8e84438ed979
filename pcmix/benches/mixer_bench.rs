//! Mixer Throughput Performance Benchmark
//!
//! Measures one second of mixing for a growing number of players, in both
//! output formats.
//!
//! **Goal:** Mixing should complete far faster than realtime
//! **Target:** >100x realtime for 8 int16 players

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pcmix::backend::BackendPlayer;
use pcmix::playback::Mixer;
use pcmix::{BytesSource, InfiniteLoop, PlayerId, SampleFormat, StreamFormat, TimeStream};
use std::sync::Arc;
use std::time::Instant;

const SAMPLE_RATE: u32 = 44_100;

/// Mixer with `players` endless int16 sources, all playing.
fn mixer_with_players(players: u64) -> (Arc<Mixer>, Vec<Arc<dyn BackendPlayer>>) {
    let format = StreamFormat::new(SAMPLE_RATE, SampleFormat::Int16);
    let mixer = Mixer::new(format);
    let mut handles: Vec<Arc<dyn BackendPlayer>> = Vec::new();
    for id in 0..players {
        let data = 1000i16.to_le_bytes().repeat(SAMPLE_RATE as usize * 2);
        let len = data.len() as u64;
        let looped = InfiniteLoop::new(BytesSource::new(data), len, SampleFormat::Int16).unwrap();
        let stream = Arc::new(TimeStream::new(Box::new(looped), format).unwrap());
        let player = mixer.new_player(PlayerId::from(id), stream);
        player.play().unwrap();
        handles.push(player);
    }
    (mixer, handles)
}

fn bench_mix_one_second(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixer_throughput");

    for output in [SampleFormat::Int16, SampleFormat::Float32] {
        for players in [1u64, 4, 8] {
            let id = BenchmarkId::new(output.to_string(), players);
            group.bench_with_input(id, &players, |b, &players| {
                let (mixer, _handles) = mixer_with_players(players);
                // 10 ms steps, as a backend would request them
                let mut out = vec![0u8; (SAMPLE_RATE as usize / 100) * output.frame_size()];

                b.iter(|| {
                    let start = Instant::now();
                    let mut mixed = 0;
                    while mixed < SAMPLE_RATE as usize * output.frame_size() {
                        mixed += mixer.read(&mut out, output).len;
                    }

                    let realtime_factor = 1.0 / start.elapsed().as_secs_f64();
                    if players == 8 && realtime_factor < 100.0 {
                        eprintln!(
                            "WARNING: {} players at {:.2}x is below 100x realtime target",
                            players, realtime_factor
                        );
                    }
                    black_box(&out);
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_mix_one_second);
criterion_main!(benches);
