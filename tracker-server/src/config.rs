use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use tracker_common::events::EventKind;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "GT06_PORT", default = "5051")]
    pub gt06_port: u16,

    #[envconfig(from = "OSMAND_PORT", default = "5055")]
    pub osmand_port: u16,

    #[envconfig(from = "ADMIN_PORT", default = "3030")]
    pub admin_port: u16,

    /// How recently a device must have reported to count as online.
    #[envconfig(default = "120000")]
    pub online_threshold: EnvMsDuration,

    /// Per-request timeout for outbound webhook deliveries.
    #[envconfig(default = "3000")]
    pub webhook_timeout: EnvMsDuration,

    /// Optional webhook endpoint registered at startup.
    #[envconfig(from = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Event kinds the startup webhook subscribes to. All kinds when unset.
    #[envconfig(from = "WEBHOOK_EVENTS")]
    pub webhook_events: Option<EventKindList>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn gt06_bind(&self) -> String {
        format!("{}:{}", self.host, self.gt06_port)
    }

    pub fn osmand_bind(&self) -> String {
        format!("{}:{}", self.host, self.osmand_port)
    }

    pub fn admin_bind(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated event kind names, e.g. `device.online,position.recorded`.
#[derive(Debug, Clone)]
pub struct EventKindList(pub Vec<EventKind>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEventKindListError;

impl FromStr for EventKindList {
    type Err = ParseEventKindListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kinds = Vec::new();
        for name in s.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let kind = name
                .parse::<EventKind>()
                .map_err(|_| ParseEventKindListError)?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            return Err(ParseEventKindListError);
        }
        Ok(EventKindList(kinds))
    }
}
