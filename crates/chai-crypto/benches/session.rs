use chai_crypto::SessionManager;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::OsRng;

fn established_pair() -> (SessionManager, SessionManager) {
    let mut alice = SessionManager::new(&mut OsRng);
    let mut bob = SessionManager::new(&mut OsRng);

    let otps = bob.generate_one_time_prekeys(&mut OsRng, 1);
    let mut bundle = bob.generate_prekey_bundle();
    bundle.one_time_prekey = Some(otps[0].1);
    bundle.one_time_prekey_id = Some(otps[0].0);

    let initial = alice.init_session(&mut OsRng, "bob", &bundle).unwrap();
    bob.decrypt(&mut OsRng, "alice", &initial).unwrap();

    (alice, bob)
}

fn bench_x3dh_initiate(c: &mut Criterion) {
    let mut bob = SessionManager::new(&mut OsRng);
    let otps = bob.generate_one_time_prekeys(&mut OsRng, 1);
    let mut bundle = bob.generate_prekey_bundle();
    bundle.one_time_prekey = Some(otps[0].1);
    bundle.one_time_prekey_id = Some(otps[0].0);

    c.bench_function("x3dh_initiate", |b| {
        b.iter(|| {
            let mut alice = SessionManager::new(&mut OsRng);
            black_box(alice.init_session(&mut OsRng, "bob", &bundle).unwrap())
        });
    });
}

fn bench_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt");
    let (mut alice, _) = established_pair();
    let message = vec![0u8; 1024];

    group.throughput(Throughput::Bytes(message.len() as u64));
    group.bench_function("encrypt_1kb", |b| {
        b.iter(|| black_box(alice.encrypt("bob", &message).unwrap()));
    });
    group.finish();
}

fn bench_in_order_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("roundtrip");
    let (mut alice, mut bob) = established_pair();
    let message = vec![0u8; 1024];

    group.throughput(Throughput::Bytes(message.len() as u64));
    group.bench_function("encrypt_decrypt_1kb", |b| {
        b.iter(|| {
            let envelope = alice.encrypt("bob", &message).unwrap();
            black_box(bob.decrypt(&mut OsRng, "alice", &envelope).unwrap())
        });
    });
    group.finish();
}

fn bench_session_export(c: &mut Criterion) {
    let (alice, _) = established_pair();

    c.bench_function("export_session", |b| {
        b.iter(|| black_box(alice.export_session("bob").unwrap()));
    });
}

criterion_group!(
    benches,
    bench_x3dh_initiate,
    bench_encrypt,
    bench_in_order_roundtrip,
    bench_session_export
);
criterion_main!(benches);
