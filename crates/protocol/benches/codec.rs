//! Benchmarks for the wire protocol
//!
//! Measures the hot paths of a polling loop:
//! - Request encoding and response decoding
//! - CRC-16 over schema-sized inputs
//! - Schema parsing

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{EndpointValue, RequestFrame, ResponseFrame, Schema, ValueType, crc16_json};

fn synthetic_schema(axes: usize) -> String {
    let mut nodes = vec![r#"{"name":"vbus_voltage","id":1,"type":"float","access":"r"}"#.to_string()];
    let mut id = 2;
    for axis in 0..axes {
        let mut members = Vec::new();
        for field in ["error", "current_state", "requested_state", "pos_estimate"] {
            members.push(format!(
                r#"{{"name":"{}","id":{},"type":"int32","access":"rw"}}"#,
                field, id
            ));
            id += 1;
        }
        nodes.push(format!(
            r#"{{"name":"axis{}","type":"object","members":[{}]}}"#,
            axis,
            members.join(",")
        ));
    }
    format!("[{}]", nodes.join(","))
}

fn benchmark_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");

    let read = RequestFrame::read(42, 17, 4, Vec::new(), 0x6da6);
    group.bench_function("encode_read", |b| b.iter(|| black_box(&read).encode()));

    let write = RequestFrame::write(43, 17, EndpointValue::new(1.5f32).to_bytes().to_vec(), 0x6da6);
    group.bench_function("encode_write", |b| b.iter(|| black_box(&write).encode()));

    let response = [0x2a, 0x80, 0x00, 0x00, 0xc0, 0x41];
    group.bench_function("decode_response", |b| {
        b.iter(|| {
            let frame = ResponseFrame::decode(black_box(&response)).unwrap();
            EndpointValue::from_bytes(ValueType::Float, &frame.body).unwrap()
        })
    });

    group.finish();
}

fn benchmark_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16_json");

    for size in [64usize, 4096, 65536].iter() {
        let data = vec![0x5a; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| crc16_json(black_box(&data)))
        });
    }

    group.finish();
}

fn benchmark_schema(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema_parse");

    for axes in [1usize, 8, 64].iter() {
        let json = synthetic_schema(*axes);
        group.throughput(Throughput::Bytes(json.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(axes), axes, |b, _| {
            b.iter(|| Schema::parse(black_box(&json), 0).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_frames, benchmark_crc, benchmark_schema);
criterion_main!(benches);
