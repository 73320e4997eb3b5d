//! Codec benchmarks for sandesh-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sandesh_protocol::{codec, Frame, SessionKind};

fn chat_frame(text_len: usize) -> Frame {
    Frame::Chat {
        session_id: "sess-bench".to_string(),
        message_id: "m-1".to_string(),
        sender_id: Some("client-4".to_string()),
        text: "x".repeat(text_len),
        sent_at: 1_700_000_000_000,
    }
}

fn bench_encode_chat(c: &mut Criterion) {
    let frame = chat_frame(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("chat_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_chat(c: &mut Criterion) {
    let frame = chat_frame(64);
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("chat_64B", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_roundtrip_invite(c: &mut Criterion) {
    let frame = Frame::invite(
        7,
        "sess-bench",
        SessionKind::VideoCall,
        "client-4",
        Some(serde_json::json!({"name": "Asha", "dob": "1994-03-12"})),
    );

    c.bench_function("roundtrip_invite", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_chat,
    bench_decode_chat,
    bench_roundtrip_invite
);
criterion_main!(benches);
