//! NATS connection configuration.
//!
//! Zero durations and a zero batch size mean "use the default"; call
//! [`NatsConfig::with_defaults`] (done by `NatsConnection::connect`) to fill
//! them in.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_core::{Error, Result, validate_prefix};

pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FETCH_BATCH_SIZE: usize = 20;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FETCH_BACKOFF: Duration = Duration::from_secs(5);
/// How long an idle ephemeral consumer survives before the broker removes it.
pub const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(60);

const ENV_PREFIX: &str = "COURIER_NATS_";

/// Where a new consumer starts reading its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Everything still in the stream.
    #[default]
    All,
    /// Only the most recent message.
    Last,
    /// The most recent message on every subject.
    LastPerSubject,
    /// Only messages published after the consumer is created.
    New,
    StartSequence(u64),
    StartTime(DateTime<Utc>),
}

impl DeliveryPolicy {
    fn validate(&self) -> Result<()> {
        match self {
            Self::StartSequence(0) => Err(Error::configuration(
                "delivery policy start-sequence requires a sequence greater than zero",
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    /// Broker URL(s), comma separated.
    pub url: String,

    /// Name of the publishing service, stamped on every outbound message.
    pub source: String,

    pub subscribe_prefix: String,
    pub publish_prefix: String,

    /// Consumers sharing a queue group share one durable cursor. Empty means
    /// every subscription gets its own ephemeral consumer.
    pub queue_group: String,

    pub token: Option<String>,
    pub credentials_file: Option<PathBuf>,

    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,

    pub fetch_batch_size: usize,
    pub fetch_timeout: Duration,
    pub fetch_backoff: Duration,

    /// Consumers require an explicit ack per message.
    pub ack_explicit: bool,
    /// Callers ack themselves. When false the subscription acks each message
    /// before handing it over.
    pub manual_ack: bool,

    pub delivery_policy: DeliveryPolicy,
    pub inactive_threshold: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            source: String::new(),
            subscribe_prefix: String::new(),
            publish_prefix: String::new(),
            queue_group: String::new(),
            token: None,
            credentials_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            fetch_batch_size: DEFAULT_FETCH_BATCH_SIZE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            fetch_backoff: DEFAULT_FETCH_BACKOFF,
            ack_explicit: true,
            manual_ack: true,
            delivery_policy: DeliveryPolicy::All,
            inactive_threshold: DEFAULT_INACTIVE_THRESHOLD,
        }
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_prefixes(mut self, subscribe: impl Into<String>, publish: impl Into<String>) -> Self {
        self.subscribe_prefix = subscribe.into();
        self.publish_prefix = publish.into();
        self
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = group.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery_policy = policy;
        self
    }

    pub fn with_manual_ack(mut self, manual_ack: bool) -> Self {
        self.manual_ack = manual_ack;
        self
    }

    /// Replace unset timeouts and batch size with defaults.
    pub fn with_defaults(mut self) -> Self {
        fn or_default(value: &mut Duration, default: Duration) {
            if value.is_zero() {
                *value = default;
            }
        }

        or_default(&mut self.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        or_default(&mut self.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        or_default(&mut self.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        or_default(&mut self.fetch_backoff, DEFAULT_FETCH_BACKOFF);
        or_default(&mut self.inactive_threshold, DEFAULT_INACTIVE_THRESHOLD);
        if self.fetch_batch_size == 0 {
            self.fetch_batch_size = DEFAULT_FETCH_BATCH_SIZE;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::configuration("url is required"));
        }
        if self.source.trim().is_empty() {
            return Err(Error::configuration("source is required"));
        }
        if self.token.is_some() && self.credentials_file.is_some() {
            return Err(Error::configuration(
                "token and credentials file are mutually exclusive",
            ));
        }
        if matches!(&self.token, Some(t) if t.is_empty()) {
            return Err(Error::configuration("token must not be empty"));
        }
        if matches!(&self.credentials_file, Some(p) if p.as_os_str().is_empty()) {
            return Err(Error::configuration("credentials file path must not be empty"));
        }
        if self.fetch_batch_size == 0 {
            return Err(Error::configuration("fetch batch size must be greater than zero"));
        }
        for (name, prefix) in [
            ("subscribe prefix", &self.subscribe_prefix),
            ("publish prefix", &self.publish_prefix),
        ] {
            validate_prefix(prefix).map_err(|e| Error::configuration(format!("{name}: {e}")))?;
        }
        self.delivery_policy.validate()
    }

    /// Load from `COURIER_NATS_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    ///
    /// Recognized keys (after the `COURIER_NATS_` prefix): `URL`, `SOURCE`,
    /// `SUBSCRIBE_PREFIX`, `PUBLISH_PREFIX`, `QUEUE_GROUP`, `TOKEN`,
    /// `CREDENTIALS_FILE`, `CONNECT_TIMEOUT`, `SHUTDOWN_TIMEOUT`,
    /// `FETCH_BATCH_SIZE`, `FETCH_TIMEOUT`, `FETCH_BACKOFF`, `ACK_EXPLICIT`,
    /// `MANUAL_ACK`, `DELIVERY_POLICY`, `DELIVERY_START_SEQUENCE`,
    /// `DELIVERY_START_TIME`, `INACTIVE_THRESHOLD`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut cfg = Self::default();

        if let Some(v) = get("URL") {
            cfg.url = v;
        }
        if let Some(v) = get("SOURCE") {
            cfg.source = v;
        }
        if let Some(v) = get("SUBSCRIBE_PREFIX") {
            cfg.subscribe_prefix = v;
        }
        if let Some(v) = get("PUBLISH_PREFIX") {
            cfg.publish_prefix = v;
        }
        if let Some(v) = get("QUEUE_GROUP") {
            cfg.queue_group = v;
        }
        cfg.token = get("TOKEN");
        cfg.credentials_file = get("CREDENTIALS_FILE").map(PathBuf::from);

        for (name, slot) in [
            ("CONNECT_TIMEOUT", &mut cfg.connect_timeout),
            ("SHUTDOWN_TIMEOUT", &mut cfg.shutdown_timeout),
            ("FETCH_TIMEOUT", &mut cfg.fetch_timeout),
            ("FETCH_BACKOFF", &mut cfg.fetch_backoff),
            ("INACTIVE_THRESHOLD", &mut cfg.inactive_threshold),
        ] {
            if let Some(v) = get(name) {
                *slot = parse_duration(&v)
                    .map_err(|e| Error::configuration(format!("{ENV_PREFIX}{name}: {e}")))?;
            }
        }

        if let Some(v) = get("FETCH_BATCH_SIZE") {
            cfg.fetch_batch_size = v.parse().map_err(|_| {
                Error::configuration(format!("{ENV_PREFIX}FETCH_BATCH_SIZE: invalid number `{v}`"))
            })?;
        }
        if let Some(v) = get("ACK_EXPLICIT") {
            cfg.ack_explicit = parse_bool("ACK_EXPLICIT", &v)?;
        }
        if let Some(v) = get("MANUAL_ACK") {
            cfg.manual_ack = parse_bool("MANUAL_ACK", &v)?;
        }

        if let Some(v) = get("DELIVERY_POLICY") {
            cfg.delivery_policy = match v.as_str() {
                "start-sequence" => {
                    let raw = get("DELIVERY_START_SEQUENCE").ok_or_else(|| {
                        Error::configuration(format!(
                            "{ENV_PREFIX}DELIVERY_START_SEQUENCE is required for start-sequence"
                        ))
                    })?;
                    let seq = raw.parse().map_err(|_| {
                        Error::configuration(format!(
                            "{ENV_PREFIX}DELIVERY_START_SEQUENCE: invalid number `{raw}`"
                        ))
                    })?;
                    DeliveryPolicy::StartSequence(seq)
                }
                "start-time" => {
                    let raw = get("DELIVERY_START_TIME").ok_or_else(|| {
                        Error::configuration(format!(
                            "{ENV_PREFIX}DELIVERY_START_TIME is required for start-time"
                        ))
                    })?;
                    let at = DateTime::parse_from_rfc3339(&raw).map_err(|e| {
                        Error::configuration(format!("{ENV_PREFIX}DELIVERY_START_TIME: {e}"))
                    })?;
                    DeliveryPolicy::StartTime(at.with_timezone(&Utc))
                }
                other => other.parse()?,
            };
        }

        Ok(cfg)
    }
}

impl FromStr for DeliveryPolicy {
    type Err = Error;

    /// Parses the policies that need no start position.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "last" => Ok(Self::Last),
            "last-per-subject" => Ok(Self::LastPerSubject),
            "new" => Ok(Self::New),
            other => Err(Error::configuration(format!("unknown delivery policy `{other}`"))),
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got `{value}`"
        ))),
    }
}

/// A bare number of seconds, or anything `humantime` reads (`250ms`, `1h 30m`).
fn parse_duration(value: &str) -> core::result::Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| format!("invalid duration `{value}`: {e}"))
}
