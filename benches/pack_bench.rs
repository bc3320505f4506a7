//! Performance benchmarks for the cipher pipeline hot path

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ssrlocal::crypto::{CipherEnv, CipherMethod, EncryptCtx};
use ssrlocal::plugin::{create_protocol, ServerInfo};

const PAYLOAD_LEN: usize = 16 * 1024;

fn auth_pack_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("auth_aes128_pack");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));

    for name in ["auth_aes128_md5", "auth_aes128_sha1"] {
        group.bench_function(name, |b| {
            let mut plugin = create_protocol(name).unwrap();
            let info = ServerInfo {
                iv: vec![0x11; 16],
                key: vec![0x22; 16],
                param: "42:bench".to_string(),
                ..ServerInfo::default()
            };
            plugin.set_server_info(&info);
            let data = vec![0xAB; PAYLOAD_LEN];

            b.iter(|| black_box(plugin.client_pre_encrypt(&data).unwrap()))
        });
    }

    group.finish();
}

fn stream_cipher_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_cipher");
    group.throughput(Throughput::Bytes(PAYLOAD_LEN as u64));

    for (name, method) in [
        ("aes-128-ctr", CipherMethod::Aes128Ctr),
        ("aes-256-ctr", CipherMethod::Aes256Ctr),
    ] {
        group.bench_function(name, |b| {
            let env = CipherEnv::new(method, "bench-pw");
            let mut enc = EncryptCtx::new(&env).unwrap();
            let data = vec![0xCD; PAYLOAD_LEN];

            b.iter(|| black_box(enc.encrypt(&data)))
        });
    }

    group.finish();
}

criterion_group!(benches, auth_pack_benchmark, stream_cipher_benchmark);
criterion_main!(benches);
