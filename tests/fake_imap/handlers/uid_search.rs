//! UID SEARCH command handler.
//!
//! The producer's incremental fetch sends `UID SEARCH UID N:*`. We
//! match emails against parsed `SearchKey` criteria from imap-types:
//!
//! - `All` -- every UID in the selected folder
//! - `Uid(set)` -- UID sequence-set matching, including the RFC 3501
//!   quirk that `N:*` always matches the highest-UID message even when
//!   its UID is below N (clients must filter; ours does)
//! - `And` -- logical conjunction
//!
//! The response format (RFC 3501 Section 7.2.5):
//!
//! ```text
//! * SEARCH 10 11 12
//! A0003 OK SEARCH completed
//! ```

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use imap_codec::imap_types::search::SearchKey;
use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle the UID SEARCH command.
pub async fn handle_uid_search<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    criteria: &[SearchKey<'_>],
    mailbox: &Mailbox,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let Some(folder) = mailbox.get_folder(folder_name) else {
        let resp = format!("{tag} BAD Folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let max_uid = folder.max_uid().unwrap_or(0);
    let all_uids: Vec<u64> = folder
        .emails
        .iter()
        .map(|e| e.uid)
        .chain(folder.phantom_uids.iter().copied())
        .collect();

    let uids: Vec<u64> = all_uids
        .iter()
        .copied()
        .filter(|uid| criteria.iter().all(|key| matches_key(*uid, max_uid, key)))
        .collect();

    // Format: "* SEARCH uid1 uid2 uid3\r\n". An empty result still
    // sends "* SEARCH\r\n".
    let uid_str: Vec<String> = uids.iter().map(ToString::to_string).collect();
    let search_line = format!("* SEARCH {}\r\n", uid_str.join(" "));
    let _ = write_line(stream, &search_line).await;
    let resp = format!("{tag} OK SEARCH completed\r\n");
    let _ = write_line(stream, &resp).await;
}

/// Check if a UID matches a single `SearchKey`.
fn matches_key(uid: u64, max_uid: u64, key: &SearchKey<'_>) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::Uid(set) => matches_sequence_set(uid, max_uid, set),
        SearchKey::And(keys) => keys.as_ref().iter().all(|k| matches_key(uid, max_uid, k)),
        SearchKey::Or(a, b) => matches_key(uid, max_uid, a) || matches_key(uid, max_uid, b),
        SearchKey::Not(k) => !matches_key(uid, max_uid, k),
        // Fallback: treat unknown criteria as matching everything.
        _ => true,
    }
}

/// UID sequence-set matching with the RFC 3501 `N:*` quirk: a range
/// with `*` covers `min(N, max_uid)..=max_uid`, so it always includes
/// the last message.
fn matches_sequence_set(uid: u64, max_uid: u64, set: &SequenceSet) -> bool {
    set.0.as_ref().iter().any(|seq| match seq {
        Sequence::Single(SeqOrUid::Value(v)) => uid == u64::from(v.get()),
        Sequence::Single(SeqOrUid::Asterisk) => uid == max_uid,
        Sequence::Range(a, b) => {
            let (low, high) = match (a, b) {
                (SeqOrUid::Value(a), SeqOrUid::Value(b)) => {
                    let (a, b) = (u64::from(a.get()), u64::from(b.get()));
                    (a.min(b), a.max(b))
                }
                (SeqOrUid::Value(a), SeqOrUid::Asterisk)
                | (SeqOrUid::Asterisk, SeqOrUid::Value(a)) => {
                    (u64::from(a.get()).min(max_uid), max_uid)
                }
                (SeqOrUid::Asterisk, SeqOrUid::Asterisk) => (max_uid, max_uid),
            };
            uid >= low && uid <= high
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use std::num::NonZeroU32;
    use tokio::io::BufReader;

    fn make_raw_email() -> Vec<u8> {
        b"From: a@b.com\r\nSubject: Test\r\n\r\nBody".to_vec()
    }

    fn uid_range_from(n: u32) -> SearchKey<'static> {
        SearchKey::Uid(SequenceSet(
            vec![Sequence::Range(
                SeqOrUid::Value(NonZeroU32::new(n).unwrap()),
                SeqOrUid::Asterisk,
            )]
            .try_into()
            .unwrap(),
        ))
    }

    async fn run(
        tag: &str,
        criteria: &[SearchKey<'_>],
        mailbox: &Mailbox,
        selected: Option<&str>,
    ) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_uid_search(tag, criteria, mailbox, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn search_all_returns_all_uids() {
        let raw = make_raw_email();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX", 1)
            .email(10, &raw)
            .email(11, &raw)
            .email(12, &raw)
            .build();

        let output = run("A1", &[SearchKey::All], &mailbox, Some("INBOX")).await;

        assert!(output.contains("* SEARCH 10 11 12"));
        assert!(output.contains("A1 OK SEARCH completed"));
    }

    #[tokio::test]
    async fn uid_range_returns_uids_above_the_floor() {
        let raw = make_raw_email();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX", 1)
            .email(10, &raw)
            .email(11, &raw)
            .email(12, &raw)
            .build();

        let output = run("A1", &[uid_range_from(11)], &mailbox, Some("INBOX")).await;
        assert!(output.contains("* SEARCH 11 12"));
    }

    #[tokio::test]
    async fn open_range_past_the_end_still_matches_the_last_message() {
        let raw = make_raw_email();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX", 1)
            .email(10, &raw)
            .email(12, &raw)
            .build();

        // "UID 13:*" with max UID 12: RFC 3501 says the last message
        // matches anyway. The client is responsible for filtering.
        let output = run("A1", &[uid_range_from(13)], &mailbox, Some("INBOX")).await;
        assert!(output.contains("* SEARCH 12\r\n"));
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let mailbox = MailboxBuilder::new().folder("INBOX", 1).build();
        let output = run("A1", &[SearchKey::All], &mailbox, None).await;
        assert!(output.contains("A1 BAD No folder selected"));
    }

    #[tokio::test]
    async fn empty_folder_returns_empty_search() {
        let mailbox = MailboxBuilder::new().folder("INBOX", 1).build();
        let output = run("A1", &[SearchKey::All], &mailbox, Some("INBOX")).await;
        assert!(output.contains("* SEARCH \r\n"));
    }

    #[tokio::test]
    async fn phantom_uids_show_up_in_search() {
        let raw = make_raw_email();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX", 1)
            .email(10, &raw)
            .phantom(11)
            .build();

        let output = run("A1", &[uid_range_from(10)], &mailbox, Some("INBOX")).await;
        assert!(output.contains("* SEARCH 10 11"));
    }
}
