//! New-chat notices for the support team.
//!
//! Notices go through a bounded queue drained by one background task, so a
//! slow or failing mail relay never holds up the chat path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::SessionId;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NotifySettings;

pub const NOTICE_SUBJECT: &str = "New Live Chat Request - GoCamp";
const NOTICE_HEADING: &str = "New Live Chat Request";

const QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatNotice {
    pub visitor_name: String,
    pub visitor_email: String,
    pub first_message: String,
    pub session_id: SessionId,
}

impl ChatNotice {
    pub fn html_body(&self, dashboard_url: &str) -> String {
        format!(
            "<h2>{NOTICE_HEADING}</h2>\n\
             <p><strong>User:</strong> {}</p>\n\
             <p><strong>Email:</strong> {}</p>\n\
             <p><strong>Initial Message:</strong></p>\n\
             <p>{}</p>\n\
             <p><strong>Session ID:</strong> {}</p>\n\
             <hr>\n\
             <p>Login to your dashboard to respond: <a href=\"{}\">Dashboard</a></p>",
            escape_html(&self.visitor_name),
            escape_html(&self.visitor_email),
            escape_html(&self.first_message),
            escape_html(self.session_id.as_str()),
            escape_html(dashboard_url),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notify request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notify endpoint returned {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &ChatNotice) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct MailRequest<'a> {
    to: &'a str,
    subject: &'a str,
    html: String,
}

/// Posts each notice as a JSON mail request to an HTTP relay.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    recipient: String,
    dashboard_url: String,
}

impl WebhookNotifier {
    pub fn new(settings: &NotifySettings, url: String) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url,
            recipient: settings.recipient.clone(),
            dashboard_url: settings.dashboard_url.clone(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &ChatNotice) -> Result<(), NotifyError> {
        let body = MailRequest {
            to: &self.recipient,
            subject: NOTICE_SUBJECT,
            html: notice.html_body(&self.dashboard_url),
        };
        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &ChatNotice) -> Result<(), NotifyError> {
        info!(
            session_id = %notice.session_id,
            visitor = %notice.visitor_name,
            email = %notice.visitor_email,
            "new chat request (no notify webhook configured)"
        );
        Ok(())
    }
}

pub fn notifier_from_settings(settings: &NotifySettings) -> Result<Arc<dyn Notifier>, NotifyError> {
    Ok(match &settings.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(settings, url.clone())?),
        None => Arc::new(LogNotifier),
    })
}

/// Sending half of the notice queue.
#[derive(Clone)]
pub struct NotifyQueue {
    tx: mpsc::Sender<ChatNotice>,
}

impl NotifyQueue {
    /// Start the worker. It stops when cancelled or when every queue handle
    /// is dropped.
    pub fn spawn(notifier: Arc<dyn Notifier>, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ChatNotice>(QUEUE_CAPACITY);
        let worker = tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(notice) => notice,
                        None => break,
                    },
                };
                match notifier.notify(&notice).await {
                    Ok(()) => info!(session_id = %notice.session_id, "chat notice sent"),
                    Err(e) => warn!(session_id = %notice.session_id, error = %e, "failed to send chat notice"),
                }
            }
        });
        (Self { tx }, worker)
    }

    /// Queue a notice without waiting. Dropped with a warning if the queue is
    /// full or the worker has stopped.
    pub fn enqueue(&self, notice: ChatNotice) {
        if let Err(e) = self.tx.try_send(notice) {
            let notice = match e {
                mpsc::error::TrySendError::Full(n) | mpsc::error::TrySendError::Closed(n) => n,
            };
            warn!(session_id = %notice.session_id, "notice queue unavailable, dropping chat notice");
        }
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
