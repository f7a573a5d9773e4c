//! Rotating account credential pool.

use parking_lot::Mutex;

use doubao_core::Error;

/// Round-robin pool of account cookies.
///
/// Hands out cookies in configuration order, wrapping around; every
/// caller advances the rotation by exactly one.
pub struct CredentialPool {
    cookies: Vec<String>,
    cursor: Mutex<usize>,
}

impl CredentialPool {
    pub fn new(cookies: Vec<String>) -> Result<Self, Error> {
        if cookies.is_empty() {
            return Err(Error::Config("credential pool cannot be empty".into()));
        }
        Ok(Self {
            cookies,
            cursor: Mutex::new(0),
        })
    }

    /// Next cookie in rotation.
    pub fn next_cookie(&self) -> String {
        let mut cursor = self.cursor.lock();
        let cookie = self.cookies[*cursor].clone();
        *cursor = (*cursor + 1) % self.cookies.len();
        cookie
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_empty_pool_rejected() {
        assert!(CredentialPool::new(Vec::new()).is_err());
    }

    #[test]
    fn test_rotation_order_wraps() {
        let pool = CredentialPool::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let seen: Vec<String> = (0..7).map(|_| pool.next_cookie()).collect();
        assert_eq!(seen, vec!["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_concurrent_rotation_is_fair() {
        let pool = Arc::new(
            CredentialPool::new(vec!["a".into(), "b".into(), "c".into()]).unwrap(),
        );
        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| pool.next_cookie()).collect::<Vec<_>>()
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for cookie in handle.join().unwrap() {
                *counts.entry(cookie).or_default() += 1;
            }
        }
        // 300 draws over 3 cookies: rotation keeps them exactly even.
        assert_eq!(counts.get("a"), Some(&100));
        assert_eq!(counts.get("b"), Some(&100));
        assert_eq!(counts.get("c"), Some(&100));
    }
}
