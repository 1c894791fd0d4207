//! Launch reminders: one deferred, independently cancellable task per accepted registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use uuid::Uuid;
use xtrobe_core::{NotificationTask, LAUNCH_TIME_FORMAT};

pub const CRATE_NAME: &str = "xtrobe-notify";

/// Synchronous refusal of a registration. Nothing is scheduled when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleRejection {
    #[error("launch time '{0}' is not in YYYY-MM-DD HH:MM:SS format")]
    InvalidFormat(String),
    #[error("launch time {0} has already passed; notification not scheduled")]
    PastDeadline(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid address '{address}': {message}")]
    Address { address: String, message: String },
    #[error("building message: {0}")]
    Message(String),
    #[error("mail transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivery capability. The scheduler only relies on this contract.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        info!(to = %message.to, subject = %message.subject, body = %message.body, "mail (log only)");
        Ok(())
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Implicit-TLS relay (SMTPS) with login credentials.
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .with_context(|| format!("configuring smtp relay {host}"))?
            .port(port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();
        Ok(Self { transport })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address.parse().map_err(|e: lettre::address::AddressError| DeliveryError::Address {
        address: address.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let email = Message::builder()
            .from(mailbox(&message.from)?)
            .to(mailbox(&message.to)?)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| DeliveryError::Message(e.to_string()))?;
        self.transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub sender: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            sender: std::env::var("XTROBE_MAIL_FROM")
                .unwrap_or_else(|_| "xtrobe@localhost".to_string()),
            smtp_host: std::env::var("XTROBE_SMTP_HOST")
                .unwrap_or_else(|_| "smtp.gmail.com".to_string()),
            smtp_port: std::env::var("XTROBE_SMTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(465),
            smtp_user: std::env::var("XTROBE_SMTP_USER").ok(),
            smtp_password: std::env::var("XTROBE_SMTP_PASSWORD").ok(),
        }
    }

    /// SMTP when credentials are configured, otherwise log-only delivery.
    pub fn build_mailer(&self) -> anyhow::Result<Arc<dyn Mailer>> {
        match (&self.smtp_user, &self.smtp_password) {
            (Some(user), Some(password)) => Ok(Arc::new(SmtpMailer::new(
                &self.smtp_host,
                self.smtp_port,
                user,
                password,
            )?)),
            _ => {
                warn!("no smtp credentials configured; reminders will only be logged");
                Ok(Arc::new(LogMailer))
            }
        }
    }
}

/// Parse a wire timestamp as local wall-clock time. Times that do not exist locally (DST gap)
/// are treated as malformed; ambiguous ones resolve to the earlier instant.
pub fn parse_launch_time(text: &str) -> Result<DateTime<Utc>, ScheduleRejection> {
    let naive = NaiveDateTime::parse_from_str(text, LAUNCH_TIME_FORMAT)
        .map_err(|_| ScheduleRejection::InvalidFormat(text.to_string()))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| ScheduleRejection::InvalidFormat(text.to_string()))
}

type TaskRegistry = Arc<Mutex<HashMap<Uuid, AbortHandle>>>;

pub struct NotificationScheduler {
    mailer: Arc<dyn Mailer>,
    sender: String,
    runtime: Handle,
    tasks: TaskRegistry,
}

impl NotificationScheduler {
    /// Must be called from within a tokio runtime; deferred tasks are spawned onto it.
    pub fn new(mailer: Arc<dyn Mailer>, sender: impl Into<String>) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("notification scheduler needs a tokio runtime")?;
        Ok(Self {
            mailer,
            sender: sender.into(),
            runtime,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Register a reminder for `fire_at_text`. Returns as soon as the deferred task exists;
    /// delivery happens later and its outcome is only logged. Identical registrations are
    /// not merged: each one yields its own task.
    pub fn schedule(
        &self,
        recipient: &str,
        title: &str,
        fire_at_text: &str,
    ) -> Result<Uuid, ScheduleRejection> {
        let fire_at = parse_launch_time(fire_at_text)?;
        let now = Utc::now();
        let delay = (fire_at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ScheduleRejection::PastDeadline(fire_at_text.to_string()))?;

        let task = NotificationTask {
            id: Uuid::new_v4(),
            recipient: recipient.to_string(),
            title: title.to_string(),
            fire_at_text: fire_at_text.to_string(),
            fire_at,
            registered_at: now,
        };
        info!(
            task_id = %task.id,
            recipient,
            fire_at = fire_at_text,
            delay_secs = delay.as_secs_f64(),
            "scheduling launch reminder"
        );
        Ok(self.spawn(task, delay))
    }

    fn spawn(&self, task: NotificationTask, delay: Duration) -> Uuid {
        let id = task.id;
        let message = OutboundMessage {
            from: self.sender.clone(),
            to: task.recipient.clone(),
            subject: task.subject(),
            body: task.body(),
        };
        let mailer = Arc::clone(&self.mailer);
        let tasks = Arc::clone(&self.tasks);

        // Held across spawn + insert so a task that fires immediately cannot miss its own entry.
        let mut registry = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            match mailer.deliver(&message).await {
                Ok(()) => info!(task_id = %id, to = %message.to, "launch reminder delivered"),
                Err(err) => error!(task_id = %id, to = %message.to, error = %err, "launch reminder delivery failed"),
            }
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
        registry.insert(id, handle.abort_handle());
        id
    }

    /// Cancel a pending reminder. Returns false when it already fired or never existed.
    /// A reminder counts as pending until its delivery attempt has finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                info!(task_id = %id, "launch reminder cancelled");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingMailer {
        fn sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        async fn deliver(&self, _message: &OutboundMessage) -> Result<(), DeliveryError> {
            Err(DeliveryError::Transport("535 authentication failed".into()))
        }
    }

    fn in_secs(secs: i64) -> String {
        (Local::now() + chrono::Duration::seconds(secs))
            .format(LAUNCH_TIME_FORMAT)
            .to_string()
    }

    fn scheduler(mailer: Arc<dyn Mailer>) -> NotificationScheduler {
        NotificationScheduler::new(mailer, "reminders@xtrobe.test").unwrap()
    }

    #[tokio::test]
    async fn malformed_timestamps_are_rejected_synchronously() {
        let mailer = Arc::new(RecordingMailer::default());
        let scheduler = scheduler(mailer);
        for bad in ["2030-01-01T10:00:00", "tomorrow", "2030-13-01 10:00:00", "2030-01-01 10:00", ""] {
            assert_eq!(
                scheduler.schedule("a@x.com", "Launch X", bad),
                Err(ScheduleRejection::InvalidFormat(bad.to_string()))
            );
        }
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_registers_nothing() {
        let mailer = Arc::new(RecordingMailer::default());
        let scheduler = scheduler(mailer.clone());
        let past = in_secs(-5);
        assert_eq!(
            scheduler.schedule("a@x.com", "Launch X", &past),
            Err(ScheduleRejection::PastDeadline(past.clone()))
        );
        assert_eq!(scheduler.pending(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reminder_fires_once_after_the_delay() {
        let mailer = Arc::new(RecordingMailer::default());
        let scheduler = scheduler(mailer.clone());
        // Second resolution on the wire: the real delay lands in (2s, 3s].
        let at = in_secs(3);
        scheduler.schedule("a@x.com", "Launch X", &at).unwrap();
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(mailer.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(1600)).await;
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Upcoming Launch: Launch X");
        assert_eq!(sent[0].body, format!("Reminder: Launch X is launching at {at}!"));
        assert_eq!(sent[0].to, "a@x.com");
        assert_eq!(sent[0].from, "reminders@xtrobe.test");
        assert_eq!(scheduler.pending(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registrations_produce_duplicate_deliveries() {
        let mailer = Arc::new(RecordingMailer::default());
        let scheduler = scheduler(mailer.clone());
        let at = in_secs(2);
        let first = scheduler.schedule("a@x.com", "Launch X", &at).unwrap();
        let second = scheduler.schedule("a@x.com", "Launch X", &at).unwrap();
        assert_ne!(first, second);
        assert_eq!(scheduler.pending(), 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mailer.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_one_task_leaves_the_others_alone() {
        let mailer = Arc::new(RecordingMailer::default());
        let scheduler = scheduler(mailer.clone());
        let keep = scheduler.schedule("keep@x.com", "Keep", &in_secs(2)).unwrap();
        let dropped = scheduler.schedule("drop@x.com", "Drop", &in_secs(2)).unwrap();

        assert!(scheduler.cancel(dropped));
        assert!(!scheduler.cancel(dropped));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "keep@x.com");
        assert!(!scheduler.cancel(keep));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_is_absorbed() {
        let scheduler = scheduler(Arc::new(FailingMailer));
        scheduler.schedule("a@x.com", "Launch X", &in_secs(2)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(scheduler.pending(), 0);

        // The scheduler keeps accepting work after a failed delivery.
        assert!(scheduler.schedule("b@x.com", "Launch Y", &in_secs(5)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wall_clock_reminder_arrives_after_two_seconds() {
        let mailer = Arc::new(RecordingMailer::default());
        let scheduler = scheduler(mailer.clone());
        let registered = std::time::Instant::now();
        scheduler
            .schedule("a@x.com", "Launch X", &in_secs(2))
            .unwrap();
        assert!(registered.elapsed() < Duration::from_millis(100));
        assert!(mailer.sent().is_empty());

        let deadline = registered + Duration::from_secs(4);
        while mailer.sent().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Upcoming Launch: Launch X");
    }

    #[test]
    fn launch_time_parses_as_local_wall_clock() {
        let parsed = parse_launch_time("2030-06-15 12:30:00").unwrap();
        let local = parsed.with_timezone(&Local);
        assert_eq!(local.format(LAUNCH_TIME_FORMAT).to_string(), "2030-06-15 12:30:00");
    }

    #[test]
    fn scheduler_requires_a_runtime() {
        assert!(NotificationScheduler::new(Arc::new(LogMailer), "x@y.z").is_err());
    }
}
