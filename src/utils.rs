use rand::distributions::Alphanumeric;
use rand::Rng;
use tiny_keccak::{Hasher, Keccak};

/// Derives the `0x`-prefixed account address for a public key: the last 20
/// bytes of its keccak-256 digest.
pub fn get_account_address(public_key: &[u8]) -> String {
    let mut keccak = Keccak::v256();
    keccak.update(public_key);

    let mut out_bytes = [0; 32];
    keccak.finalize(&mut out_bytes);
    format!("0x{}", hex::encode(&out_bytes[12..]))
}

/// Lowercase alphanumeric string used to keep scratch names unique.
pub fn generate_random_string(length: usize) -> String {
    let rng = rand::thread_rng();
    rng.sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_address_is_twenty_bytes() {
        let address = get_account_address(&[7u8; 32]);
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert_eq!(address, get_account_address(&[7u8; 32]));
        assert_ne!(address, get_account_address(&[8u8; 32]));
    }

    #[test]
    fn random_string_has_requested_length() {
        let value = generate_random_string(6);
        assert_eq!(value.len(), 6);
        assert!(value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()));
    }
}
