use ::imap::{ClientBuilder, ConnectionMode, Session, TlsKind};
use async_trait::async_trait;
use mailparse::{MailHeaderMap, ParsedMail};
use tracing::{debug, warn};

use super::{FetchScope, MailMessage, MailboxError, MailboxSource};
use crate::config::ImapSettings;

const FETCH_CHUNK_SIZE: usize = 50;

#[derive(Clone)]
struct ImapCredentials {
    host: String,
    port: u16,
    username: String,
    password: String,
    mailbox: String,
    skip_tls_verify: bool,
}

/// Blocking IMAP session driven from tokio's blocking pool.
#[derive(Clone)]
pub struct ImapMailbox {
    credentials: ImapCredentials,
}

impl ImapMailbox {
    pub fn from_settings(settings: &ImapSettings) -> Result<Self, MailboxError> {
        let require = |value: &Option<String>, name: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| MailboxError::Config(format!("{name} is not configured")))
        };

        Ok(Self {
            credentials: ImapCredentials {
                host: require(&settings.imap_host, "IMAP_HOST")?,
                port: settings.imap_port,
                username: require(&settings.imap_user, "IMAP_USER")?,
                password: require(&settings.imap_password, "IMAP_PASSWORD")?,
                mailbox: settings.imap_mailbox.clone(),
                skip_tls_verify: settings.imap_skip_tls_verify,
            },
        })
    }
}

#[async_trait]
impl MailboxSource for ImapMailbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch(&self, scope: FetchScope) -> Result<Vec<MailMessage>, MailboxError> {
        let credentials = self.credentials.clone();
        tokio::task::spawn_blocking(move || fetch_blocking(&credentials, scope)).await?
    }
}

fn connect(credentials: &ImapCredentials) -> Result<Session<::imap::Connection>, MailboxError> {
    debug!(
        "imap connect host={} port={}",
        credentials.host, credentials.port
    );
    let client = ClientBuilder::new(credentials.host.as_str(), credentials.port)
        .tls_kind(TlsKind::Native)
        .mode(ConnectionMode::AutoTls)
        .danger_skip_tls_verify(credentials.skip_tls_verify)
        .connect()?;
    let session = client
        .login(&credentials.username, &credentials.password)
        .map_err(|e| e.0)?;
    Ok(session)
}

fn fetch_blocking(
    credentials: &ImapCredentials,
    scope: FetchScope,
) -> Result<Vec<MailMessage>, MailboxError> {
    let mut session = connect(credentials)?;
    let mailbox = session.select(&credentials.mailbox)?;
    if mailbox.exists == 0 {
        let _ = session.logout();
        return Ok(Vec::new());
    }

    let mut uids: Vec<u32> = session.uid_search("ALL")?.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    if let Some(limit) = scope.limit() {
        uids.truncate(limit);
    }
    debug!(
        "imap mailbox={} exists={} fetching={}",
        credentials.mailbox,
        mailbox.exists,
        uids.len()
    );

    let mut messages = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(FETCH_CHUNK_SIZE) {
        let uid_set = chunk
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.uid_fetch(uid_set, "(UID BODY.PEEK[])")?;
        messages.extend(parse_fetched(
            fetches
                .iter()
                .filter_map(|fetch| Some((fetch.uid?, fetch.body()?))),
        ));
    }
    let _ = session.logout();

    messages.sort_by(|a, b| {
        b.uid
            .parse::<u32>()
            .unwrap_or(0)
            .cmp(&a.uid.parse::<u32>().unwrap_or(0))
    });
    Ok(messages)
}

/// Parses fetched bodies, skipping any message the parser rejects.
fn parse_fetched<'a>(bodies: impl IntoIterator<Item = (u32, &'a [u8])>) -> Vec<MailMessage> {
    bodies
        .into_iter()
        .filter_map(|(uid, raw)| match parse_message(uid, raw) {
            Ok(message) => Some(message),
            Err(error) => {
                warn!("skipping unparseable message uid={uid}: {error}");
                None
            }
        })
        .collect()
}

pub(crate) fn parse_message(uid: u32, raw: &[u8]) -> Result<MailMessage, MailboxError> {
    let parsed = mailparse::parse_mail(raw)?;
    let header = |name: &str| parsed.headers.get_first_value(name).unwrap_or_default();

    let mut body_text = None;
    let mut body_html = None;
    collect_bodies(&parsed, &mut body_text, &mut body_html);

    Ok(MailMessage {
        uid: uid.to_string(),
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        date: header("Date"),
        body_text,
        body_html,
    })
}

/// First text/plain and first text/html leaf, depth first.
fn collect_bodies(part: &ParsedMail<'_>, text: &mut Option<String>, html: &mut Option<String>) {
    if part.subparts.is_empty() {
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        let slot = match mimetype.as_str() {
            "text/plain" => text,
            "text/html" => html,
            _ => return,
        };
        if slot.is_none() {
            *slot = part.get_body().ok();
        }
        return;
    }
    for child in &part.subparts {
        collect_bodies(child, text, html);
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_fetched, parse_message};

    #[test]
    fn parses_multipart_alternative() {
        let raw = concat!(
            "From: Tenant <tenant@example.com>\r\n",
            "To: office@example.com\r\n",
            "Subject: Heating\r\n",
            "Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Radiator is cold\r\n",
            "--b1\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>Radiator is cold</p>\r\n",
            "--b1--\r\n",
        );
        let message = parse_message(42, raw.as_bytes()).expect("parse message");
        assert_eq!(message.uid, "42");
        assert_eq!(message.subject, "Heating");
        assert!(message
            .body_text
            .as_deref()
            .is_some_and(|body| body.contains("Radiator is cold")));
        assert!(message.body_html.is_some());
    }

    #[test]
    fn parses_single_part_plain_text() {
        let raw = "Subject: Hi\r\nFrom: a@example.com\r\n\r\nBody line\r\n";
        let message = parse_message(1, raw.as_bytes()).expect("parse message");
        assert_eq!(message.from, "a@example.com");
        assert!(message.body_html.is_none());
        assert!(message
            .body_text
            .as_deref()
            .is_some_and(|body| body.contains("Body line")));
    }

    #[test]
    fn malformed_message_is_skipped_among_good_ones() {
        let good = "Subject: Boiler\r\nFrom: a@example.com\r\n\r\nNo hot water\r\n";
        let broken = " continuation without a header\r\nSubject: x\r\n\r\nbody\r\n";
        assert!(parse_message(8, broken.as_bytes()).is_err());

        let messages = parse_fetched(vec![
            (9, good.as_bytes()),
            (8, broken.as_bytes()),
            (7, good.as_bytes()),
        ]);
        let uids: Vec<&str> = messages.iter().map(|m| m.uid.as_str()).collect();
        assert_eq!(uids, vec!["9", "7"]);
        assert_eq!(messages[0].subject, "Boiler");
    }
}
