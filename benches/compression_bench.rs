use criterion::{black_box, criterion_group, criterion_main, Criterion};
use modpak::codec::{Codec, Lz4Codec, ZstdCodec};
use modpak::container::{AppendOptions, Container};
use modpak::resolver::{LoadError, ModuleLoader, Resolver, ResolverOptions};
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

struct DiscardLoader;

impl ModuleLoader for DiscardLoader {
    type Module = usize;

    fn load_bytes(&self, _: &Uuid, bytes: Vec<u8>) -> Result<usize, LoadError> {
        Ok(bytes.len())
    }

    fn load_path(&self, _: &Uuid, _: &Path) -> Result<usize, LoadError> {
        Ok(0)
    }
}

fn module_like(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) ^ (i >> 7)) as u8).collect()
}

fn bench_codecs(c: &mut Criterion) {
    let data = module_like(1024 * 1024);
    let zstd = ZstdCodec::default();
    let lz4 = Lz4Codec;

    c.bench_function("zstd_encode_1mb", |b| b.iter(|| zstd.encode(black_box(&data))));
    c.bench_function("lz4_encode_1mb", |b| b.iter(|| lz4.encode(black_box(&data))));

    let packed = zstd.encode(&data).unwrap();
    c.bench_function("zstd_decode_1mb", |b| b.iter(|| zstd.decode(black_box(&packed), data.len())));
}

fn bench_container_append(c: &mut Criterion) {
    let data = module_like(256 * 1024);

    c.bench_function("append_16x256k_zstd", |b| {
        b.iter(|| {
            let mut container = Container::create(Cursor::new(Vec::new())).unwrap();
            for i in 0..16 {
                container.append(&format!("module{i}"), black_box(&data), &AppendOptions::default()).unwrap();
            }
            container.close().unwrap()
        })
    });
}

fn bench_resolve(c: &mut Criterion) {
    let mut container = Container::create(Cursor::new(Vec::new())).unwrap();
    for i in 0..256 {
        container.append(&format!("module{i}"), &module_like(4096), &AppendOptions::default()).unwrap();
    }
    let stream = container.close().unwrap();

    let options = ResolverOptions {
        search_path:  Vec::new(),
        temp_dir:     std::env::temp_dir().join("modpak-bench"),
        architecture: modpak::Architecture::native(),
    };
    let resolver = Resolver::new(options, DiscardLoader);
    resolver.register_container(stream).unwrap();

    c.bench_function("resolve_4k_of_256", |b| b.iter(|| resolver.resolve(black_box("module128"))));
    c.bench_function("load_cached", |b| b.iter(|| resolver.load(black_box("module128"))));
}

criterion_group!(benches, bench_codecs, bench_container_append, bench_resolve);
criterion_main!(benches);
