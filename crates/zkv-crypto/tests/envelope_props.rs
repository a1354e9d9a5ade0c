//! Property tests for authenticated envelopes and searchable hashes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use proptest::prelude::*;
use secrecy::SecretString;
use std::sync::Arc;

use zkv_core::types::{EncryptedEnvelope, KdfParams};
use zkv_core::ZkvError;
use zkv_crypto::{hash_field, AuthenticatedCipher, KeyCache};

// Low iteration count keeps each case fast; the parameters travel in the envelope.
const PARAMS: KdfParams = KdfParams::new(64);

fn cipher() -> AuthenticatedCipher {
    AuthenticatedCipher::new(Arc::new(KeyCache::disabled()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn roundtrip_any_plaintext(plaintext in ".{0,512}", secret in "[ -~]{1,40}") {
        let c = cipher();
        let secret = SecretString::from(secret);
        let envelope = c.encrypt(&plaintext, &secret, &PARAMS).unwrap();
        prop_assert!(envelope.is_authenticated());
        prop_assert_eq!(c.decrypt(&envelope, &secret).unwrap(), plaintext);
    }

    #[test]
    fn wrong_secret_never_decrypts(
        plaintext in ".{1,256}",
        right in "[a-z]{4,16}",
        wrong in "[A-Z]{4,16}",
    ) {
        let c = cipher();
        let envelope = c.encrypt(&plaintext, &SecretString::from(right), &PARAMS).unwrap();
        let err = c.decrypt(&envelope, &SecretString::from(wrong)).unwrap_err();
        prop_assert!(matches!(err, ZkvError::TamperDetected));
    }

    #[test]
    fn any_ciphertext_bit_flip_is_detected(
        plaintext in ".{1,256}",
        byte_seed in any::<usize>(),
        bit in 0u8..8,
    ) {
        let c = cipher();
        let secret = SecretString::from("prop-secret");
        let mut envelope = c.encrypt(&plaintext, &secret, &PARAMS).unwrap();

        let payload = envelope.payload_mut();
        let mut raw = BASE64.decode(&payload.encrypted_data).unwrap();
        let idx = byte_seed % raw.len();
        raw[idx] ^= 1 << bit;
        payload.encrypted_data = BASE64.encode(raw);

        prop_assert!(matches!(c.decrypt(&envelope, &secret), Err(ZkvError::TamperDetected)));
    }

    #[test]
    fn any_tag_bit_flip_is_detected(byte_seed in any::<usize>(), bit in 0u8..8) {
        let c = cipher();
        let secret = SecretString::from("prop-secret");
        let envelope = c.encrypt("payload", &secret, &PARAMS).unwrap();

        let (payload, tag) = match envelope {
            EncryptedEnvelope::Authenticated { payload, hmac } => (payload, hmac),
            EncryptedEnvelope::Legacy(_) => unreachable!("encrypt always tags"),
        };
        let mut raw = hex::decode(tag).unwrap();
        let idx = byte_seed % raw.len();
        raw[idx] ^= 1 << bit;
        let tampered = EncryptedEnvelope::Authenticated { payload, hmac: hex::encode(raw) };

        prop_assert!(matches!(c.decrypt(&tampered, &secret), Err(ZkvError::TamperDetected)));
    }

    #[test]
    fn search_hash_ignores_case_and_padding(
        value in "[a-zA-Z0-9.@]{1,32}",
        pad_left in " {0,3}",
        pad_right in "[ \t]{0,3}",
        owner in "[a-z0-9]{1,12}",
    ) {
        let padded = format!("{pad_left}{}{pad_right}", value.to_uppercase());
        prop_assert_eq!(hash_field(&value, &owner), hash_field(&padded, &owner));
    }

    #[test]
    fn search_hash_separates_owners(value in "[a-z]{1,16}", a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
        prop_assume!(a != b);
        prop_assert_ne!(hash_field(&value, &a), hash_field(&value, &b));
    }
}
