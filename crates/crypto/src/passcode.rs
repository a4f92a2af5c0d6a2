//! Numeric passcodes for interactive invitations.

use rand::Rng;

/// Random decimal code of `length` digits. Leading zeros are allowed.
pub fn generate_passcode(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passcode_shape() {
        let code = generate_passcode(6);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(generate_passcode(0).is_empty());
    }
}
