use serde::Deserialize;
use url::Url;

pub const DEFAULT_MAX_RETRIES: u64 = 5;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub amqp_url: Option<Url>,
    pub queue_name: Option<String>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_queue: Option<String>,
    pub retry_exchange: Option<String>,
    pub retry_queue: Option<String>,
    pub retry_delay_ms: Option<u32>,
    pub max_retries: Option<u64>,
    pub prefetch: Option<u16>,
    pub consumer_tag: Option<String>,
    pub db_path: Option<String>,
    pub health_host: Option<String>,
    pub health_port: Option<u16>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("TASKWORKER_").from_env::<Self>()?)
    }

    pub fn amqp_url(&self) -> &str {
        self.amqp_url
            .as_ref()
            .map(|u| u.as_str())
            .unwrap_or("amqp://localhost:5672/%2f")
    }

    pub fn queue_name(&self) -> &str {
        self.queue_name.as_deref().unwrap_or("task_queue")
    }

    pub fn dead_letter_exchange(&self) -> &str {
        self.dead_letter_exchange
            .as_deref()
            .unwrap_or("dead_letter_exchange")
    }

    pub fn dead_letter_queue(&self) -> &str {
        self.dead_letter_queue
            .as_deref()
            .unwrap_or("dead_letter_queue")
    }

    pub fn retry_exchange(&self) -> &str {
        self.retry_exchange.as_deref().unwrap_or("retry_exchange")
    }

    pub fn retry_queue(&self) -> &str {
        self.retry_queue.as_deref().unwrap_or("retry_queue")
    }

    /// How long a rejected message waits in the retry queue.
    pub fn retry_delay_ms(&self) -> u32 {
        self.retry_delay_ms.unwrap_or(5000)
    }

    pub fn max_retries(&self) -> u64 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch.unwrap_or(1)
    }

    pub fn consumer_tag(&self) -> &str {
        self.consumer_tag.as_deref().unwrap_or("taskworker")
    }

    /// `None` selects an in-memory database.
    pub fn db_path(&self) -> Option<&str> {
        match self.db_path.as_deref() {
            Some(":memory:") => None,
            Some(path) => Some(path),
            None => Some("taskworker.db"),
        }
    }

    pub fn health_addr(&self) -> (&str, u16) {
        (
            self.health_host.as_deref().unwrap_or("0.0.0.0"),
            self.health_port.unwrap_or(3000),
        )
    }
}
