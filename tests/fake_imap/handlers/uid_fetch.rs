//! UID FETCH command handler.
//!
//! The pipeline's producer asks for
//! `(UID RFC822.SIZE BODY.PEEK[HEADER] BODY.PEEK[TEXT])`, so the
//! response carries two **counted literals** -- one per section:
//!
//! ```text
//! * <seq> FETCH (UID <uid> RFC822.SIZE <n> BODY[HEADER] {<hlen>}
//! <exactly hlen bytes of headers>
//!  BODY[TEXT] {<tlen>}
//! <exactly tlen bytes of body>
//! )
//! ```
//!
//! The `{length}\r\n` literal marker tells the client "the next
//! `length` bytes are raw data, not protocol text". The raw RFC 2822
//! message is split at the first blank line: headers (including the
//! terminating blank line) on one side, body text on the other.
//!
//! UIDs listed in the folder's `phantom_uids` produce no FETCH
//! response at all, simulating a message expunged between SEARCH and
//! FETCH.

use crate::fake_imap::io::{write_bytes, write_line};
use crate::fake_imap::mailbox::Mailbox;
use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Extract UIDs from a `SequenceSet`. Only single values are
/// supported, matching what the client sends for per-UID fetches.
fn extract_uids(seq_set: &SequenceSet) -> Vec<u64> {
    seq_set
        .0
        .as_ref()
        .iter()
        .filter_map(|seq| match seq {
            Sequence::Single(SeqOrUid::Value(v)) => Some(u64::from(v.get())),
            _ => None,
        })
        .collect()
}

/// Split a raw RFC 2822 message into (headers, body) at the first
/// blank line. The headers keep their terminating CRLF CRLF.
fn split_sections(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let boundary = raw.windows(4).position(|w| w == b"\r\n\r\n");
    match boundary {
        Some(pos) => (raw[..pos + 4].to_vec(), raw[pos + 4..].to_vec()),
        None => (raw.to_vec(), Vec::new()),
    }
}

/// Handle the UID FETCH command.
pub async fn handle_uid_fetch<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    sequence_set: &SequenceSet,
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

    for uid in extract_uids(sequence_set) {
        if let Some((idx, email)) = folder.emails.iter().enumerate().find(|(_, e)| e.uid == uid) {
            let seq = idx + 1; // 1-based sequence number
            let (header, text) = split_sections(&email.raw);
            let size = email.raw.len();

            let opening = format!(
                "* {seq} FETCH (UID {uid} RFC822.SIZE {size} BODY[HEADER] {{{}}}\r\n",
                header.len()
            );
            if write_line(stream, &opening).await.is_err() {
                return;
            }
            if write_bytes(stream, &header).await.is_err() {
                return;
            }

            let text_item = format!(" BODY[TEXT] {{{}}}\r\n", text.len());
            if write_line(stream, &text_item).await.is_err() {
                return;
            }
            if write_bytes(stream, &text).await.is_err() {
                return;
            }

            if write_line(stream, ")\r\n").await.is_err() {
                return;
            }
        }
    }

    let resp = format!("{tag} OK FETCH completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use std::num::NonZeroU32;
    use tokio::io::BufReader;

    fn make_raw_email() -> Vec<u8> {
        b"From: a@b.com\r\nSubject: Test\r\n\r\nBody text".to_vec()
    }

    fn uid_set(uid: u32) -> SequenceSet {
        SequenceSet(
            vec![Sequence::Single(SeqOrUid::Value(
                NonZeroU32::new(uid).unwrap(),
            ))]
            .try_into()
            .unwrap(),
        )
    }

    async fn run(
        tag: &str,
        sequence_set: &SequenceSet,
        mailbox: &Mailbox,
        selected: Option<&str>,
    ) -> String {
        let (client, server) = tokio::io::duplex(8192);
        let mut stream = BufReader::new(server);

        handle_uid_fetch(tag, sequence_set, mailbox, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn split_keeps_the_header_terminator() {
        let raw = make_raw_email();
        let (header, text) = split_sections(&raw);
        assert!(header.ends_with(b"\r\n\r\n"));
        assert_eq!(text, b"Body text");
    }

    #[test]
    fn split_handles_headerless_input() {
        let (header, text) = split_sections(b"no blank line here");
        assert_eq!(header, b"no blank line here");
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn fetches_both_sections_by_uid() {
        let raw = make_raw_email();
        let mailbox = MailboxBuilder::new()
            .folder("INBOX", 1)
            .email(42, &raw)
            .build();

        let output = run("A1", &uid_set(42), &mailbox, Some("INBOX")).await;

        assert!(output.contains("* 1 FETCH (UID 42 RFC822.SIZE"));
        assert!(output.contains("BODY[HEADER]"));
        assert!(output.contains("BODY[TEXT]"));
        assert!(output.contains("From: a@b.com"));
        assert!(output.contains("Body text"));
        assert!(output.contains("A1 OK FETCH completed"));
    }

    #[tokio::test]
    async fn phantom_uid_returns_only_ok() {
        let mailbox = MailboxBuilder::new()
            .folder("INBOX", 1)
            .phantom(99)
            .build();

        let output = run("A1", &uid_set(99), &mailbox, Some("INBOX")).await;

        assert!(!output.contains("FETCH (UID"));
        assert!(output.contains("A1 OK FETCH completed"));
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let mailbox = MailboxBuilder::new().folder("INBOX", 1).build();
        let output = run("A1", &uid_set(1), &mailbox, None).await;
        assert!(output.contains("A1 BAD No folder selected"));
    }
}
