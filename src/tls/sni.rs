//! SNI directory
//!
//! Maps a hostname, or a hostname whose leftmost label is `*`, to the
//! certificate file a server session should present for it. Entries are
//! managed administratively and live independently of any session.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Hostname pattern to certificate file mapping
#[derive(Debug, Default)]
pub struct SniDirectory {
    entries: RwLock<HashMap<String, String>>,
}

impl SniDirectory {
    pub fn new() -> Self {
        SniDirectory::default()
    }

    /// Add or replace the certificate file for `domain`
    ///
    /// An empty `file` records that the domain explicitly has no
    /// certificate; lookups skip such entries.
    pub fn add(&self, domain: &str, file: impl Into<String>) {
        let file = file.into();
        log::debug!("SNI mapping {} -> {:?}", domain, file);
        self.entries.write().insert(domain.to_ascii_lowercase(), file);
    }

    /// Remove the mapping for `domain`, returning whether it existed
    pub fn remove(&self, domain: &str) -> bool {
        self.entries
            .write()
            .remove(&domain.to_ascii_lowercase())
            .is_some()
    }

    /// Find the certificate file for a requested hostname
    ///
    /// Tries the lower-cased name first, then once with its leftmost label
    /// replaced by `*`. Entries with an empty file never match.
    pub fn lookup(&self, domain: &str) -> Option<String> {
        if domain.is_empty() {
            return None;
        }

        let name = domain.to_ascii_lowercase();
        let entries = self.entries.read();

        if let Some(file) = entries.get(&name).filter(|file| !file.is_empty()) {
            return Some(file.clone());
        }

        let wildcard = wildcard_of(&name)?;
        entries
            .get(&wildcard)
            .filter(|file| !file.is_empty())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every mapping
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Replace the leftmost label of `name` with `*`
fn wildcard_of(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let dot = name.find('.')?;
    Some(format!("*{}", &name[dot..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_lookup() {
        let dir = SniDirectory::new();
        dir.add("example.com", "example.pem");

        assert_eq!(dir.lookup("example.com"), Some("example.pem".to_string()));
        assert_eq!(dir.lookup("other.com"), None);
        assert_eq!(dir.lookup(""), None);
    }

    #[test]
    fn test_case_insensitive() {
        let dir = SniDirectory::new();
        dir.add("Example.COM", "x.pem");

        assert_eq!(dir.lookup("example.com"), Some("x.pem".to_string()));
        assert_eq!(dir.lookup("EXAMPLE.com"), Some("x.pem".to_string()));
    }

    #[test]
    fn test_wildcard_fallback() {
        let dir = SniDirectory::new();
        dir.add("*.example.com", "wild.pem");

        assert_eq!(dir.lookup("a.example.com"), Some("wild.pem".to_string()));
        assert_eq!(dir.lookup("A.Example.Com"), Some("wild.pem".to_string()));
        assert_eq!(dir.lookup("example.com"), None);
        // Only the leftmost label is replaced, never further up the chain
        assert_eq!(dir.lookup("b.a.example.com"), None);
    }

    #[test]
    fn test_exact_match_preferred() {
        let dir = SniDirectory::new();
        dir.add("*.example.com", "wild.pem");
        dir.add("mail.example.com", "mail.pem");

        assert_eq!(dir.lookup("mail.example.com"), Some("mail.pem".to_string()));
        assert_eq!(dir.lookup("www.example.com"), Some("wild.pem".to_string()));
    }

    #[test]
    fn test_empty_file_skipped() {
        let dir = SniDirectory::new();
        dir.add("*.example.com", "wild.pem");
        dir.add("none.example.com", "");

        assert_eq!(dir.lookup("none.example.com"), Some("wild.pem".to_string()));

        dir.remove("*.example.com");
        assert_eq!(dir.lookup("none.example.com"), None);
    }

    #[test]
    fn test_leading_dot_and_bare_names() {
        let dir = SniDirectory::new();
        dir.add("*.com", "com.pem");
        dir.add("*", "star.pem");

        assert_eq!(dir.lookup(".com"), None);
        assert_eq!(dir.lookup("localhost"), None);
        assert_eq!(dir.lookup("example.com"), Some("com.pem".to_string()));
    }

    #[test]
    fn test_add_replace_remove() {
        let dir = SniDirectory::new();
        dir.add("example.com", "old.pem");
        dir.add("example.com", "new.pem");
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.lookup("example.com"), Some("new.pem".to_string()));

        assert!(dir.remove("EXAMPLE.com"));
        assert!(!dir.remove("example.com"));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_concurrent_lookup_and_mutation() {
        use std::sync::Arc;
        use std::thread;

        let dir = Arc::new(SniDirectory::new());
        dir.add("*.example.com", "wild.pem");

        let writer = {
            let dir = dir.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let domain = format!("host{}.example.com", i);
                    dir.add(&domain, "exact.pem");
                    dir.remove(&domain);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let dir = dir.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        let file = dir.lookup(&format!("host{}.example.com", i)).unwrap();
                        assert!(file == "wild.pem" || file == "exact.pem");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(dir.len(), 1);
    }
}
