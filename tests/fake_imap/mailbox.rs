//! Test data model for the fake IMAP server
//!
//! Provides a builder-style API for constructing mailbox state:
//!
//! ```ignore
//! let mailbox = MailboxBuilder::new()
//!     .folder("INBOX", 700)
//!         .email(10, raw_rfc2822_bytes)
//!         .email(11, raw_rfc2822_bytes)
//!     .build();
//! ```
//!
//! The `Mailbox` is shared with the server via `Arc<Mutex<..>>` so
//! tests can mutate it between polls -- most importantly bumping a
//! folder's `uidvalidity` to simulate an epoch reset, and adding
//! emails to simulate new arrivals.

/// A complete mailbox: a collection of named folders.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub folders: Vec<Folder>,
}

impl Mailbox {
    /// Look up a folder by name (case-sensitive, matching real IMAP).
    pub fn get_folder(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn get_folder_mut(&mut self, name: &str) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|f| f.name == name)
    }
}

/// A single IMAP folder with its UID epoch.
#[derive(Debug, Clone)]
pub struct Folder {
    pub name: String,
    /// The folder's UIDVALIDITY. Changing it tells clients that every
    /// UID they remember for this folder is now meaningless.
    pub uidvalidity: u64,
    pub emails: Vec<TestEmail>,
    /// UIDs reported by SEARCH but missing at FETCH time, simulating a
    /// message expunged between the two commands.
    pub phantom_uids: Vec<u64>,
}

impl Folder {
    /// Replace this folder's contents with a new epoch.
    pub fn reset_epoch(&mut self, uidvalidity: u64) {
        self.uidvalidity = uidvalidity;
        self.emails.clear();
        self.phantom_uids.clear();
    }

    pub fn max_uid(&self) -> Option<u64> {
        self.emails
            .iter()
            .map(|e| e.uid)
            .chain(self.phantom_uids.iter().copied())
            .max()
    }
}

/// A test email stored in a folder.
///
/// - `uid`: IMAP UID -- unique per folder under the current epoch.
/// - `raw`: the complete RFC 2822 message (headers + body) as bytes.
///   FETCH splits it into BODY[HEADER] and BODY[TEXT] at the blank
///   line.
#[derive(Debug, Clone)]
pub struct TestEmail {
    pub uid: u64,
    pub raw: Vec<u8>,
}

/// Builder for constructing a `Mailbox` step by step.
pub struct MailboxBuilder {
    folders: Vec<Folder>,
}

impl MailboxBuilder {
    pub fn new() -> Self {
        Self {
            folders: Vec::new(),
        }
    }

    /// Add a new folder with the given UIDVALIDITY. Subsequent
    /// `.email()` calls add to this folder.
    pub fn folder(mut self, name: &str, uidvalidity: u64) -> Self {
        self.folders.push(Folder {
            name: name.to_string(),
            uidvalidity,
            emails: Vec::new(),
            phantom_uids: Vec::new(),
        });
        self
    }

    /// Add an email to the most recently added folder.
    ///
    /// # Panics
    ///
    /// Panics if called before any `.folder()` call.
    pub fn email(mut self, uid: u64, raw: &[u8]) -> Self {
        self.folders
            .last_mut()
            .expect("call .folder() before .email()")
            .emails
            .push(TestEmail {
                uid,
                raw: raw.to_vec(),
            });
        self
    }

    /// Add a UID that SEARCH reports but FETCH cannot find.
    ///
    /// # Panics
    ///
    /// Panics if called before any `.folder()` call.
    pub fn phantom(mut self, uid: u64) -> Self {
        self.folders
            .last_mut()
            .expect("call .folder() before .phantom()")
            .phantom_uids
            .push(uid);
        self
    }

    /// Consume the builder and return the finished `Mailbox`.
    pub fn build(self) -> Mailbox {
        Mailbox {
            folders: self.folders,
        }
    }
}
