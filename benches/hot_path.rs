use criterion::{black_box, criterion_group, criterion_main, Criterion};

use audio_streamer::audio::{GainStage, Normalizer, SourceFormat};
use audio_streamer::codec::ogg::OggOpusMuxer;

fn bench_gain_stage(c: &mut Criterion) {
    // one 40 ms stereo frame at 48 kHz
    let input: Vec<f32> = (0..3840).map(|i| ((i as f32) * 0.01).sin() * 0.9).collect();
    let mut out = vec![0i16; input.len()];
    let stage = GainStage::from_db(6.0, -1.0);

    c.bench_function("gain_stage_40ms", |b| {
        b.iter(|| stage.process(black_box(&input), &mut out))
    });
}

fn bench_normalizer(c: &mut Criterion) {
    let input: Vec<f32> = (0..441).map(|i| ((i as f32) * 0.02).sin()).collect();
    let mut normalizer = Normalizer::new(SourceFormat {
        sample_rate: 44_100,
        channels: 1,
    });
    let mut out = Vec::with_capacity(1024);

    c.bench_function("normalize_44k1_mono_10ms", |b| {
        b.iter(|| {
            out.clear();
            normalizer.process(black_box(&input), &mut out);
        })
    });
}

fn bench_ogg_muxer(c: &mut Criterion) {
    let packet = vec![0x5Au8; 800];
    let mut muxer = OggOpusMuxer::new(0x1234_5678, 48_000, 2, "bench").expect("muxer");
    muxer.take();

    c.bench_function("ogg_write_packet", |b| {
        b.iter(|| {
            muxer.write_packet(black_box(&packet), 1920).expect("packet");
            black_box(muxer.take());
        })
    });
}

criterion_group!(benches, bench_gain_stage, bench_normalizer, bench_ogg_muxer);
criterion_main!(benches);
