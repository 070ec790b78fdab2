//! Random fixtures for tests and local seeding

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

use crate::currency::Currency;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Random integer in `[min, max]`
pub fn random_int(min: i64, max: i64) -> i64 {
    rand::thread_rng().gen_range(min..=max)
}

/// Random lowercase string of length `n`
pub fn random_string(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn random_owner() -> String {
    random_string(6)
}

pub fn random_amount() -> i64 {
    random_int(0, 1000)
}

pub fn random_currency() -> Currency {
    *Currency::ALL
        .choose(&mut rand::thread_rng())
        .unwrap_or(&Currency::Usd)
}

pub fn random_email() -> String {
    format!("{}@email.com", random_string(6))
}

/// Random alphanumeric token, e.g. a fake password hash
pub fn random_token(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_int_in_range() {
        for _ in 0..100 {
            let v = random_int(5, 7);
            assert!((5..=7).contains(&v));
        }
    }

    #[test]
    fn test_random_string_is_lowercase() {
        let s = random_string(12);
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn test_random_currency_is_supported() {
        for _ in 0..20 {
            assert!(crate::currency::is_supported(random_currency().as_str()));
        }
    }
}
