//! Producer: incremental IMAP polling into the primary stream
//!
//! One loop per `(account, mailbox)`. Each cycle authenticates a fresh
//! session, observes UIDVALIDITY, reconciles the persisted cursor,
//! fetches everything above `last_uid` in ascending order, and appends
//! records with piggybacked approximate trimming. The cursor advances
//! through the longest prefix of the batch whose fetch and append both
//! succeeded, so a failed UID is re-attempted next cycle and anything
//! re-appended after it is collapsed downstream by the idempotency
//! filter.

use crate::auth::AuthProvider;
use crate::breaker::CircuitBreaker;
use crate::config::ProducerConfig;
use crate::correlation;
use crate::error::{Error, Result};
use crate::idempotency;
use crate::imap::{FetchedMail, MailSession};
use crate::metrics::Metrics;
use crate::record::MailRecord;
use crate::shutdown::ShutdownCoordinator;
use crate::store::{LogStore, StateStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Headers carried into the record beyond the parsed envelope fields.
const CARRIED_HEADERS: &[&str] = &[
    "Content-Type",
    "List-Id",
    "Reply-To",
    "In-Reply-To",
    "References",
    "Delivered-To",
];

/// Persisted polling position for one `(account, mailbox)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub last_uid: u64,
    pub uidvalidity: Option<u64>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub total_emails: u64,
}

/// Cursor persistence on the state store's key layout.
#[derive(Clone)]
pub struct CursorStore {
    state: Arc<dyn StateStore>,
}

impl CursorStore {
    #[must_use]
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    fn key(account: &str, mailbox: &str, field: &str) -> String {
        format!("producer_state:{account}:{mailbox}:{field}")
    }

    pub async fn load(&self, account: &str, mailbox: &str) -> Result<Cursor> {
        let last_uid = self
            .state
            .get(&Self::key(account, mailbox, "last_uid"))
            .await?
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| Error::Invalid(format!("corrupt last_uid '{v}': {e}")))
            })
            .transpose()?
            .unwrap_or(0);

        let uidvalidity = self
            .state
            .get(&Self::key(account, mailbox, "uidvalidity"))
            .await?
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| Error::Invalid(format!("corrupt uidvalidity '{v}': {e}")))
            })
            .transpose()?;

        let last_poll_at = self
            .state
            .get(&Self::key(account, mailbox, "last_poll"))
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let total_emails = self
            .state
            .get(&Self::key(account, mailbox, "total_emails"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Cursor {
            last_uid,
            uidvalidity,
            last_poll_at,
            total_emails,
        })
    }

    /// Write the new epoch and the zeroed UID cursor in one atomic
    /// round trip, before any fetch against the new epoch.
    pub async fn reset_epoch(&self, account: &str, mailbox: &str, uidvalidity: u64) -> Result<()> {
        self.state
            .set_many(&[
                (
                    &Self::key(account, mailbox, "uidvalidity"),
                    uidvalidity.to_string(),
                ),
                (&Self::key(account, mailbox, "last_uid"), "0".to_string()),
            ])
            .await
    }

    /// Record a completed batch: cursor position, poll time, totals.
    pub async fn advance(
        &self,
        account: &str,
        mailbox: &str,
        cursor: &Cursor,
    ) -> Result<()> {
        let mut pairs: Vec<(String, String)> = vec![
            (
                Self::key(account, mailbox, "last_uid"),
                cursor.last_uid.to_string(),
            ),
            (
                Self::key(account, mailbox, "total_emails"),
                cursor.total_emails.to_string(),
            ),
        ];
        if let Some(uidvalidity) = cursor.uidvalidity {
            pairs.push((
                Self::key(account, mailbox, "uidvalidity"),
                uidvalidity.to_string(),
            ));
        }
        if let Some(last_poll_at) = cursor.last_poll_at {
            pairs.push((
                Self::key(account, mailbox, "last_poll"),
                last_poll_at.to_rfc3339(),
            ));
        }
        let borrowed: Vec<(&str, String)> = pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        self.state.set_many(&borrowed).await
    }

    /// Update only the poll timestamp (empty cycle).
    pub async fn touch_poll(&self, account: &str, mailbox: &str, at: DateTime<Utc>) -> Result<()> {
        self.state
            .set(&Self::key(account, mailbox, "last_poll"), &at.to_rfc3339())
            .await
    }
}

/// Operational counters exposed on `/status`.
#[derive(Debug, Default)]
pub struct ProducerStats {
    pub polls: AtomicU64,
    pub produced: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub epoch_resets: AtomicU64,
    pub auth_healthy: AtomicBool,
}

impl ProducerStats {
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "polls": self.polls.load(Ordering::Relaxed),
            "produced": self.produced.load(Ordering::Relaxed),
            "fetch_failures": self.fetch_failures.load(Ordering::Relaxed),
            "epoch_resets": self.epoch_resets.load(Ordering::Relaxed),
            "auth_healthy": self.auth_healthy.load(Ordering::Relaxed),
        })
    }
}

/// The producer role: cursor engine plus supervision hooks.
pub struct Producer {
    config: ProducerConfig,
    auth: Arc<dyn AuthProvider>,
    log: Arc<dyn LogStore>,
    state: Arc<dyn StateStore>,
    cursors: CursorStore,
    imap_breaker: Arc<CircuitBreaker>,
    store_breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    shutdown: Arc<ShutdownCoordinator>,
    stats: Arc<ProducerStats>,
}

impl Producer {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProducerConfig,
        auth: Arc<dyn AuthProvider>,
        log: Arc<dyn LogStore>,
        state: Arc<dyn StateStore>,
        imap_breaker: Arc<CircuitBreaker>,
        store_breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let cursors = CursorStore::new(Arc::clone(&state));
        Self {
            config,
            auth,
            log,
            state,
            cursors,
            imap_breaker,
            store_breaker,
            metrics,
            shutdown,
            stats: Arc::new(ProducerStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ProducerStats> {
        Arc::clone(&self.stats)
    }

    /// Poll until shutdown. Fatal auth conditions are returned; other
    /// failures are counted and retried next cycle.
    pub async fn run(&self) -> Result<()> {
        self.stats.auth_healthy.store(true, Ordering::Relaxed);

        while self.shutdown.is_running() {
            let outcome = self.poll_once().await;

            match outcome {
                Ok(appended) => {
                    self.stats.auth_healthy.store(true, Ordering::Relaxed);
                    debug!(appended, "poll cycle complete");
                }
                Err(e @ Error::AuthSetupRequired(_)) => return Err(e),
                Err(e @ (Error::TokenRefreshFailed(_) | Error::TokenRevoked(_))) => {
                    self.stats.auth_healthy.store(false, Ordering::Relaxed);
                    warn!("authentication unavailable, polling paused: {e}");
                }
                Err(Error::CircuitOpen(name)) => {
                    debug!(breaker = %name, "circuit open, waiting out the recovery window");
                }
                Err(Error::Shutdown) => break,
                Err(e) => warn!("poll cycle failed: {e}"),
            }

            if !self.shutdown.sleep(self.config.poll_interval).await {
                break;
            }
        }
        Ok(())
    }

    /// Run one poll cycle inside its own correlation scope. Returns
    /// how many records were appended.
    pub async fn poll_once(&self) -> Result<u64> {
        correlation::scope(correlation::new_id(), self.poll_cycle()).await
    }

    async fn poll_cycle(&self) -> Result<u64> {
        let account = self.config.imap.username.clone();
        let mailbox = self.config.imap.mailbox.clone();

        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        self.metrics.imap_polls_total.inc();
        let poll_timer = self.metrics.imap_poll_duration_seconds.start_timer();

        let mut session = self.connect_with_refresh_retry().await?;

        let result = self.poll_mailbox(&mut session, &account, &mailbox).await;
        session.logout().await;
        poll_timer.observe_duration();
        result
    }

    /// Connect and authenticate, forcing one token refresh if the
    /// server rejects an apparently valid token.
    async fn connect_with_refresh_retry(&self) -> Result<MailSession> {
        let sasl = self
            .auth
            .sasl_xoauth2(&self.config.imap.username)
            .await?;

        let first = self
            .imap_breaker
            .call(MailSession::connect_xoauth2(&self.config.imap, sasl))
            .await;

        match first {
            Ok(session) => Ok(session),
            Err(Error::ImapAuth(reason)) => {
                warn!("IMAP rejected token ({reason}), forcing a refresh and retrying once");
                self.auth
                    .force_refresh()
                    .await
                    .map_err(|e| Error::TokenRefreshFailed(e.to_string()))?;
                let sasl = self
                    .auth
                    .sasl_xoauth2(&self.config.imap.username)
                    .await?;
                self.imap_breaker
                    .call(MailSession::connect_xoauth2(&self.config.imap, sasl))
                    .await
                    .map_err(|e| match e {
                        Error::ImapAuth(r) => Error::TokenRefreshFailed(format!(
                            "rejected again after forced refresh: {r}"
                        )),
                        other => other,
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_mailbox(
        &self,
        session: &mut MailSession,
        account: &str,
        mailbox: &str,
    ) -> Result<u64> {
        let status = self
            .imap_breaker
            .call(session.select(mailbox))
            .await?;

        let mut cursor = self
            .store_breaker
            .call(self.cursors.load(account, mailbox))
            .await?;

        if let Some(previous) = cursor.uidvalidity
            && previous != status.uidvalidity
        {
            self.reset_epoch(account, mailbox, previous, status.uidvalidity, &mut cursor)
                .await?;
        }

        let mut uids = self
            .imap_breaker
            .call(session.search_uids_above(cursor.last_uid))
            .await?;
        uids.sort_unstable();
        uids.truncate(self.config.batch_size);

        let now = Utc::now();
        if uids.is_empty() {
            self.store_breaker
                .call(self.cursors.touch_poll(account, mailbox, now))
                .await?;
            debug!(mailbox, "no new messages");
            return Ok(0);
        }

        info!(mailbox, count = uids.len(), "fetching new messages");

        // Advance only through the consecutive successful prefix so a
        // failed UID is revisited next cycle.
        let mut confirmed_uid = None;
        let mut appended: u64 = 0;
        let mut prefix_intact = true;

        for uid in uids {
            if !self.shutdown.is_running() {
                self.finish_batch(account, mailbox, &mut cursor, confirmed_uid, appended, now)
                    .await?;
                return Err(Error::Shutdown);
            }

            let fetched = match self.imap_breaker.call(session.fetch(uid)).await {
                Ok(Some(fetched)) => fetched,
                Ok(None) => {
                    self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(uid, "message vanished before fetch, will revisit next cycle");
                    prefix_intact = false;
                    continue;
                }
                Err(e @ (Error::ImapTransport(_) | Error::CircuitOpen(_))) => {
                    // Session is gone; persist what we have and bail.
                    self.finish_batch(account, mailbox, &mut cursor, confirmed_uid, appended, now)
                        .await?;
                    return Err(e);
                }
                Err(e) => {
                    self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(uid, "fetch failed ({e}), will revisit next cycle");
                    prefix_intact = false;
                    continue;
                }
            };

            let record = self.build_record(account, mailbox, status.uidvalidity, &fetched);

            if self.config.dry_run {
                info!(
                    uid = record.uid,
                    subject = %record.subject,
                    from = %record.from,
                    "dry run: skipping append"
                );
            } else {
                let payload = record.to_payload()?;
                let append = self
                    .store_breaker
                    .call(self.log.append(
                        &self.config.streams.stream,
                        &[("payload", payload)],
                        Some(self.config.streams.max_stream_length),
                    ))
                    .await;

                match append {
                    Ok(entry_id) => {
                        debug!(uid, %entry_id, "record appended");
                        self.metrics.emails_produced_total.inc();
                        self.stats.produced.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.finish_batch(
                            account, mailbox, &mut cursor, confirmed_uid, appended, now,
                        )
                        .await?;
                        return Err(e);
                    }
                }
            }

            appended += 1;
            if prefix_intact {
                confirmed_uid = Some(uid);
            }
        }

        self.finish_batch(account, mailbox, &mut cursor, confirmed_uid, appended, now)
            .await?;
        Ok(appended)
    }

    async fn reset_epoch(
        &self,
        account: &str,
        mailbox: &str,
        previous: u64,
        current: u64,
        cursor: &mut Cursor,
    ) -> Result<()> {
        warn!(
            account,
            mailbox,
            previous_uidvalidity = previous,
            uidvalidity = current,
            "UIDVALIDITY changed, resetting cursor to the new epoch"
        );
        self.store_breaker
            .call(self.cursors.reset_epoch(account, mailbox, current))
            .await?;
        cursor.uidvalidity = Some(current);
        cursor.last_uid = 0;
        self.stats.epoch_resets.fetch_add(1, Ordering::Relaxed);

        // The superseded partition only wastes memory; clear it off the
        // critical path.
        let state = Arc::clone(&self.state);
        let stale_key = idempotency::partition_key(account, mailbox, previous);
        tokio::spawn(async move {
            if let Err(e) = state.delete(&stale_key).await {
                warn!(key = %stale_key, "failed to clear stale idempotency partition: {e}");
            }
        });
        Ok(())
    }

    /// Persist the cursor after a (possibly partial) batch. In dry-run
    /// mode the cursor is left untouched so nothing is consumed.
    async fn finish_batch(
        &self,
        account: &str,
        mailbox: &str,
        cursor: &mut Cursor,
        confirmed_uid: Option<u64>,
        appended: u64,
        polled_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        let Some(confirmed_uid) = confirmed_uid else {
            return self
                .store_breaker
                .call(self.cursors.touch_poll(account, mailbox, polled_at))
                .await;
        };

        cursor.last_uid = confirmed_uid;
        cursor.last_poll_at = Some(polled_at);
        cursor.total_emails += appended;
        self.store_breaker
            .call(self.cursors.advance(account, mailbox, cursor))
            .await
    }

    fn build_record(
        &self,
        account: &str,
        mailbox: &str,
        uidvalidity: u64,
        fetched: &FetchedMail,
    ) -> MailRecord {
        let cap = self.config.body_preview_bytes;
        let parsed = mailparse::parse_headers(&fetched.header).ok();

        let header_value = |name: &str| -> Option<String> {
            parsed
                .as_ref()
                .and_then(|(headers, _)| headers.iter().find(|h| h.get_key_ref().eq_ignore_ascii_case(name)))
                .map(|h| h.get_value())
        };

        let to = header_value("To")
            .map(|raw| {
                raw.split(',')
                    .map(|addr| addr.trim().to_string())
                    .filter(|addr| !addr.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut headers = BTreeMap::new();
        for name in CARRIED_HEADERS {
            if let Some(value) = header_value(name) {
                headers.insert((*name).to_string(), value);
            }
        }

        let content_type = header_value("Content-Type").unwrap_or_default();
        let body = String::from_utf8_lossy(&fetched.text);
        let preview = truncate_utf8(&body, cap);
        let (body_text, body_html_preview) = if content_type.to_ascii_lowercase().contains("text/html")
        {
            (String::new(), preview)
        } else {
            (preview, String::new())
        };

        MailRecord {
            uid: fetched.uid,
            uidvalidity,
            mailbox: mailbox.to_string(),
            account: account.to_string(),
            from: header_value("From").unwrap_or_default(),
            to,
            subject: header_value("Subject").unwrap_or_default(),
            date: header_value("Date").unwrap_or_default(),
            message_id: header_value("Message-ID").unwrap_or_default(),
            size: fetched.size,
            headers,
            body_text,
            body_html_preview,
            fetched_at: Utc::now(),
            correlation_id: correlation::current_or_empty(),
        }
    }
}

/// Truncate to at most `max_bytes`, never splitting a UTF-8 character.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
