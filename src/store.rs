//! Mail storage backends
//!
//! The SMTP core only ever calls [`MailStore::store_email`]. The read side
//! exists for the front ends that present stored mail.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::Local;
use uuid::Uuid;

use crate::error::StorageError;

/// A message as held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEmail {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: String,
    pub body: Vec<u8>,
}

/// Persistence capability used by the SMTP server.
///
/// Calls are blocking; the server runs them off the async executor and
/// makes at most one `store_email` call per accepted message.
pub trait MailStore: Send + Sync {
    /// Persists a message and returns its id. `body` is stored byte for byte.
    fn store_email(&self, from: &str, to: &[String], body: &[u8]) -> Result<String, StorageError>;

    /// Every stored message, oldest first.
    fn get_emails(&self) -> Result<Vec<StoredEmail>, StorageError>;

    fn get_email(&self, id: &str) -> Result<StoredEmail, StorageError>;
}

/// One `.eml` file per message under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens the store, creating `dir` when missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StorageError> {
        // Ids are generated uuids; anything else could escape the directory.
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.eml", id)))
    }
}

fn parse_eml(id: &str, content: &[u8]) -> Result<StoredEmail, StorageError> {
    let split = content
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .ok_or_else(|| StorageError::Corrupt {
            id: id.to_string(),
            reason: "missing header separator",
        })?;
    let headers = String::from_utf8_lossy(&content[..split]);

    let mut email = StoredEmail {
        id: id.to_string(),
        from: String::new(),
        to: Vec::new(),
        date: String::new(),
        body: content[split + 2..].to_vec(),
    };
    for header in headers.lines() {
        if let Some(from) = header.strip_prefix("From: ") {
            email.from = from.to_string();
        } else if let Some(to) = header.strip_prefix("To: ") {
            email.to = to.split(',').map(str::to_string).collect();
        } else if let Some(date) = header.strip_prefix("Date: ") {
            email.date = date.to_string();
        }
    }
    Ok(email)
}

impl MailStore for FileStore {
    fn store_email(&self, from: &str, to: &[String], body: &[u8]) -> Result<String, StorageError> {
        if from.is_empty() {
            return Err(StorageError::Rejected("empty from address"));
        }
        if to.is_empty() {
            return Err(StorageError::Rejected("no recipients specified"));
        }
        if body.is_empty() {
            return Err(StorageError::Rejected("empty email content"));
        }

        let id = Uuid::new_v4().to_string();
        let path = self.path_for(&id)?;
        let mut content = format!(
            "From: {}\nTo: {}\nDate: {}\n\n",
            from,
            to.join(","),
            Local::now().to_rfc2822()
        )
        .into_bytes();
        content.extend_from_slice(body);
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, content)?;

        tracing::info!(id = %id, path = %path.display(), recipients = to.len(), "message stored");
        Ok(id)
    }

    fn get_emails(&self) -> Result<Vec<StoredEmail>, StorageError> {
        let mut emails = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("eml") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            // Files are written once, so mtime is the arrival time.
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match fs::read(&path) {
                Ok(content) => match parse_eml(id, &content) {
                    Ok(email) => emails.push((modified, email)),
                    Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
                },
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }
        emails.sort_by(|(a_time, a), (b_time, b)| a_time.cmp(b_time).then_with(|| a.id.cmp(&b.id)));
        Ok(emails.into_iter().map(|(_, email)| email).collect())
    }

    fn get_email(&self, id: &str) -> Result<StoredEmail, StorageError> {
        let path = self.path_for(id)?;
        let content = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(id.to_string()),
            _ => StorageError::Io(e),
        })?;
        parse_eml(id, &content)
    }
}

/// Keeps messages in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    emails: Mutex<Vec<StoredEmail>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn emails(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredEmail>>, StorageError> {
        self.emails
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl MailStore for MemoryStore {
    fn store_email(&self, from: &str, to: &[String], body: &[u8]) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        self.emails()?.push(StoredEmail {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_vec(),
            date: Local::now().to_rfc2822(),
            body: body.to_vec(),
        });
        Ok(id)
    }

    fn get_emails(&self) -> Result<Vec<StoredEmail>, StorageError> {
        Ok(self.emails()?.clone())
    }

    fn get_email(&self, id: &str) -> Result<StoredEmail, StorageError> {
        self.emails()?
            .iter()
            .find(|email| email.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> FileStore {
        let dir = std::env::temp_dir().join(format!("smtp-inbox-store-{}", Uuid::new_v4()));
        FileStore::new(dir).unwrap()
    }

    fn recipients(list: &[&str]) -> Vec<String> {
        list.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn file_store_writes_and_reads_back() {
        let store = scratch_store();
        let to = recipients(&["b@b.com", "c@c.com"]);
        let id = store
            .store_email("a@a.com", &to, b"Subject: x\r\n\r\nhello\r\n")
            .unwrap();

        assert!(store.dir().join(format!("{}.eml", id)).exists());

        let email = store.get_email(&id).unwrap();
        assert_eq!(email.from, "a@a.com");
        assert_eq!(email.to, to);
        assert_eq!(email.body, b"Subject: x\r\n\r\nhello\r\n");
        assert!(!email.date.is_empty());

        let all = store.get_emails().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
    }

    #[test]
    fn file_store_keeps_8bit_bodies() {
        let store = scratch_store();
        let body = b"Subject: caf\xe9\r\n\r\n\xff\xfe raw\r\n";
        let id = store.store_email("a@a.com", &recipients(&["b@b.com"]), body).unwrap();
        assert_eq!(store.get_email(&id).unwrap().body, body);
    }

    #[test]
    fn file_store_lists_oldest_first() {
        let store = scratch_store();
        let to = recipients(&["b@b.com"]);
        let mut ids = Vec::new();
        for body in [b"one", b"two", b"six"] {
            ids.push(store.store_email("a@a.com", &to, body).unwrap());
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let listed: Vec<String> = store.get_emails().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn file_store_rejects_incomplete_messages() {
        let store = scratch_store();
        let to = recipients(&["b@b.com"]);
        assert!(matches!(
            store.store_email("", &to, b"body"),
            Err(StorageError::Rejected(_))
        ));
        assert!(matches!(
            store.store_email("a@a.com", &[], b"body"),
            Err(StorageError::Rejected(_))
        ));
        assert!(matches!(
            store.store_email("a@a.com", &to, b""),
            Err(StorageError::Rejected(_))
        ));
        assert!(store.get_emails().unwrap().is_empty());
    }

    #[test]
    fn file_store_unknown_and_hostile_ids() {
        let store = scratch_store();
        assert!(matches!(
            store.get_email("0000-missing"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.get_email("../etc/passwd"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn file_store_skips_foreign_files() {
        let store = scratch_store();
        fs::write(store.dir().join("notes.txt"), "hello").unwrap();
        fs::write(store.dir().join("broken.eml"), "no separator").unwrap();
        assert!(store.get_emails().unwrap().is_empty());
        assert!(matches!(
            store.get_email("broken"),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn memory_store_keeps_arrival_order() {
        let store = MemoryStore::new();
        let first = store.store_email("a@a.com", &recipients(&["x@b.com"]), b"one").unwrap();
        let second = store.store_email("a@a.com", &recipients(&["y@b.com"]), b"two").unwrap();

        let all = store.get_emails().unwrap();
        assert_eq!(all.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), [first.as_str(), second.as_str()]);
        assert_eq!(store.get_email(&second).unwrap().body, b"two");
        assert!(store.get_email("nope").is_err());
    }
}
