use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_reactor::{
    codec::{adler32, decode_frames, Message, TaggedCodec, TypedCodec},
    Buffer,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Query {
    id: i64,
    questioner: String,
    question: Vec<String>,
}

impl Message for Query {
    const TYPE_NAME: &'static str = "muduo.Query";
}

fn query(lines: usize) -> Query {
    Query {
        id: 1,
        questioner: "Liu wj".into(),
        question: vec!["Running?".to_string(); lines],
    }
}

fn bench_adler32(c: &mut Criterion) {
    let mut group = c.benchmark_group("adler32");
    for size in [64usize, 4096, 64 * 1024] {
        let data = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| adler32(1, black_box(data)))
        });
    }
    group.finish();
}

fn bench_typed_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("typed_encode");
    for lines in [1usize, 64] {
        let message = query(lines);
        group.bench_with_input(BenchmarkId::new("lines", lines), &message, |b, message| {
            b.iter(|| {
                let mut buf = Buffer::new();
                TypedCodec::fill_empty_buffer(&mut buf, black_box(message)).unwrap();
                black_box(buf.readable_bytes())
            })
        });
    }
    group.finish();
}

fn bench_typed_decode_stream(c: &mut Criterion) {
    let mut wire = Buffer::new();
    for _ in 0..100 {
        let mut frame = Buffer::new();
        TypedCodec::fill_empty_buffer(&mut frame, &query(4)).unwrap();
        wire.append(frame.peek());
    }
    let wire = wire.peek().to_vec();

    let mut group = c.benchmark_group("typed_decode");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("100_frames", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            buf.append(&wire);
            let mut decoded = 0;
            decode_frames(&mut buf, TypedCodec::MIN_MESSAGE_LEN, |data| {
                let message: Query = TypedCodec::decode(data)?;
                decoded += message.question.len();
                Ok(())
            })
            .unwrap();
            black_box(decoded)
        })
    });
    group.finish();
}

fn bench_tagged(c: &mut Criterion) {
    let codec: TaggedCodec<Query> = TaggedCodec::new("QRY0", |_, _, _| {});
    let mut frame = Buffer::new();
    codec.fill_empty_buffer(&mut frame, &query(4)).unwrap();
    let body = frame.peek()[4..].to_vec();

    c.bench_function("tagged_parse", |b| {
        b.iter(|| codec.parse(black_box(&body)).unwrap())
    });
}

criterion_group!(
    codec_benches,
    bench_adler32,
    bench_typed_encode,
    bench_typed_decode_stream,
    bench_tagged,
);
criterion_main!(codec_benches);
