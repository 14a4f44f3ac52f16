use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mpack::{BufferAllocator, MessageReader, MessageSink, MessageSource, MessageWriter};

fn encode_values(writer: &mut MessageWriter<Vec<u8>>, count: u64) {
    for i in 0..count {
        writer.write_array_header(3).unwrap();
        writer.write_i64(i as i64 - 500).unwrap();
        writer.write_u64(i.wrapping_mul(0x9e37_79b9)).unwrap();
        writer.write_f64(i as f64 * 0.5).unwrap();
    }
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    let allocator = BufferAllocator::pooled(mpack::AllocatorOptions::default());

    group.throughput(Throughput::Elements(1000));
    group.bench_function("integers_1k", |b| {
        b.iter(|| {
            let sink = MessageSink::new(Vec::with_capacity(16 * 1024), &allocator).unwrap();
            let mut writer = MessageWriter::new(sink);
            encode_values(&mut writer, 1000);
            writer.flush().unwrap();
            black_box(writer.into_sink().into_channel());
        });
    });

    let text = "benchmark payload with some text in it".repeat(4);
    group.throughput(Throughput::Bytes(text.len() as u64 * 8));
    group.bench_function("strings_8x152b", |b| {
        b.iter(|| {
            let sink = MessageSink::new(Vec::with_capacity(4 * 1024), &allocator).unwrap();
            let mut writer = MessageWriter::new(sink);
            for _ in 0..8 {
                writer.write_str(&text).unwrap();
            }
            writer.flush().unwrap();
            black_box(writer.into_sink().into_channel());
        });
    });

    let payload = vec![0xabu8; 64 * 1024];
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("binary_64kb", |b| {
        b.iter(|| {
            let sink = MessageSink::new(Vec::with_capacity(80 * 1024), &allocator).unwrap();
            let mut writer = MessageWriter::new(sink);
            writer.write_binary(&payload).unwrap();
            writer.flush().unwrap();
            black_box(writer.into_sink().into_channel());
        });
    });

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    let allocator = BufferAllocator::pooled(mpack::AllocatorOptions::default());

    let sink = MessageSink::new(Vec::new(), &allocator).unwrap();
    let mut writer = MessageWriter::new(sink);
    encode_values(&mut writer, 1000);
    writer.flush().unwrap();
    let integer_wire = writer.into_sink().into_channel();

    group.throughput(Throughput::Elements(1000));
    group.bench_function("integers_1k", |b| {
        b.iter(|| {
            let source = MessageSource::new(integer_wire.as_slice(), &allocator).unwrap();
            let mut reader = MessageReader::new(source);
            for _ in 0..1000 {
                reader.read_array_header().unwrap();
                black_box(reader.read_i64().unwrap());
                black_box(reader.read_u64().unwrap());
                black_box(reader.read_f64().unwrap());
            }
        });
    });

    let sink = MessageSink::new(Vec::new(), &allocator).unwrap();
    let mut writer = MessageWriter::new(sink);
    for i in 0..512 {
        writer
            .write_str(if i % 2 == 0 { "request_id" } else { "payload" })
            .unwrap();
    }
    writer.flush().unwrap();
    let identifier_wire = writer.into_sink().into_channel();

    group.throughput(Throughput::Elements(512));
    group.bench_function("identifiers_512", |b| {
        b.iter(|| {
            let source = MessageSource::new(identifier_wire.as_slice(), &allocator).unwrap();
            let mut reader = MessageReader::new(source);
            for _ in 0..512 {
                black_box(reader.read_identifier().unwrap());
            }
        });
    });

    group.throughput(Throughput::Elements(1000));
    group.bench_function("skip_values_1k", |b| {
        b.iter(|| {
            let source = MessageSource::new(integer_wire.as_slice(), &allocator).unwrap();
            let mut reader = MessageReader::new(source);
            reader.skip_values(1000).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
