use secrecy::SecretString;
use std::sync::Arc;
use zkv_core::types::KdfParams;
use zkv_crypto::{derive_key, AuthenticatedCipher, KeyCache};

const PARAMS: KdfParams = KdfParams::new(10_000);

fn make_plaintext(size: usize) -> String {
    (0..size)
        .map(|i| (b'a' + (i.wrapping_mul(7) % 26) as u8) as char)
        .collect()
}

#[divan::bench(args = [1_000, 10_000, 100_000])]
fn bench_derive_key(bencher: divan::Bencher, iterations: u32) {
    let secret = SecretString::from("bench-secret");
    let params = KdfParams::new(iterations);
    bencher.bench(|| derive_key(divan::black_box(&secret), b"bench-salt", &params).unwrap());
}

#[divan::bench(args = [256, 4096, 65536])]
fn bench_encrypt(bencher: divan::Bencher, size: usize) {
    let cipher = AuthenticatedCipher::default();
    let secret = SecretString::from("bench-secret");
    let plaintext = make_plaintext(size);
    // Fresh salt per call: every iteration pays two PBKDF2 derivations.
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            cipher
                .encrypt(divan::black_box(&plaintext), &secret, &PARAMS)
                .unwrap()
        });
}

#[divan::bench(args = [256, 4096, 65536])]
fn bench_decrypt_cached(bencher: divan::Bencher, size: usize) {
    let cipher = AuthenticatedCipher::default();
    let secret = SecretString::from("bench-secret");
    let envelope = cipher
        .encrypt(&make_plaintext(size), &secret, &PARAMS)
        .unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| cipher.decrypt(divan::black_box(&envelope), &secret).unwrap());
}

#[divan::bench(args = [256, 4096])]
fn bench_decrypt_uncached(bencher: divan::Bencher, size: usize) {
    let cipher = AuthenticatedCipher::new(Arc::new(KeyCache::disabled()));
    let secret = SecretString::from("bench-secret");
    let envelope = cipher
        .encrypt(&make_plaintext(size), &secret, &PARAMS)
        .unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| cipher.decrypt(divan::black_box(&envelope), &secret).unwrap());
}

fn main() {
    divan::main();
}
