//! Identifier generation for cars, engines, and agent sessions.
//!
//! All identifiers are a fixed ASCII prefix followed by lowercase hex,
//! generated from the OS RNG. They are not cryptographically significant —
//! only unique enough that a single retry on collision is sufficient (see
//! [`crate::services::car::CarService::create`]).

use rand::Rng;

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len.div_ceil(2)).map(|_| rng.gen::<u8>()).collect();
    let mut hex = hex::encode(bytes);
    hex.truncate(len);
    hex
}

/// Generate a car id: `car-` + 5 lowercase hex chars.
pub fn new_car_id() -> String {
    format!("car-{}", random_hex(5))
}

/// Generate an engine id: `eng-` + 8 lowercase hex chars.
pub fn new_engine_id() -> String {
    format!("eng-{}", random_hex(8))
}

/// Generate a session id: `sess-` + 8 lowercase hex chars.
pub fn new_session_id() -> String {
    format!("sess-{}", random_hex(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn car_id_has_expected_shape() {
        let id = new_car_id();
        assert!(id.starts_with("car-"));
        assert_eq!(id.len(), "car-".len() + 5);
        assert!(id["car-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn engine_id_has_expected_shape() {
        let id = new_engine_id();
        assert!(id.starts_with("eng-"));
        assert_eq!(id.len(), "eng-".len() + 8);
    }

    #[test]
    fn session_id_has_expected_shape() {
        let id = new_session_id();
        assert!(id.starts_with("sess-"));
        assert_eq!(id.len(), "sess-".len() + 8);
    }

    #[test]
    fn ids_are_not_trivially_constant() {
        let a = new_car_id();
        let b = new_car_id();
        assert_ne!(a, b, "two generated ids collided immediately — RNG looks broken");
    }
}
