use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use opcua_channel::config::EncodingLimits;
use opcua_channel::core::types::{Array, BuiltinType, NodeId, Variant};
use opcua_channel::core::{BinaryDecoder, BinaryEncoder};

#[allow(clippy::unwrap_used)]
fn encode(value: &Variant) -> Bytes {
    let mut encoder = BinaryEncoder::new(EncodingLimits::default());
    encoder.write_variant(value).unwrap();
    encoder.finish()
}

#[allow(clippy::unwrap_used)]
fn bench_variant_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("variant_codec");
    let samples = [
        ("int32", Variant::Int32(-42)),
        ("string", Variant::String(Some("a".repeat(256)))),
        (
            "node_id",
            Variant::NodeId(Box::new(NodeId::string(2, "Objects.Boiler.Temperature"))),
        ),
        (
            "double_array_1k",
            Variant::Array(Box::new(
                Array::new(
                    BuiltinType::Double,
                    (0..1024).map(|i| Variant::Double(i as f64 * 0.5)).collect(),
                )
                .unwrap(),
            )),
        ),
    ];

    for (name, value) in &samples {
        let wire = encode(value);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| encode(value));
        });
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter_batched(
                || wire.clone(),
                |wire| {
                    let mut decoder = BinaryDecoder::new(wire, EncodingLimits::default());
                    decoder.read_variant().unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_variant_codec);
criterion_main!(benches);
