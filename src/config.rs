//! 환경 변수 기반 설정 관리

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub database_url: String,
    pub cors_origins: Vec<String>,
    pub limits: LimitsConfig,
    pub ice: IceConfig,
    pub log_level: String,
    /// `/api/channels/:id/messages` 등록 여부. 요청자 확인이 없으므로 기본은 꺼짐.
    pub history_api: bool,
}

/// 연결/저장소 한도
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// 연결당 송신 큐 크기. 가득 차면 해당 연결은 방에서 제외된다.
    pub outbound_queue: usize,
    pub send_timeout_ms: u64,
    pub persist_timeout_ms: u64,
    /// 메시지 최대 길이 (문자 수)
    pub max_message_len: usize,
}

impl LimitsConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

/// ICE 서버 설정 (STUN + 선택적 TURN)
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: TurnConfig,
}

/// TURN 서버 설정
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub host: String,
    pub secret: String,
    pub port: u16,
    pub tls_port: u16,
    pub enable_tls: bool,
    pub credential_ttl: u64,
}

impl TurnConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.secret.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            host: "0.0.0.0".to_string(),
            database_url: "sqlite://relay.db".to_string(),
            cors_origins: vec!["http://localhost:5173".to_string()],
            limits: LimitsConfig {
                outbound_queue: 256,
                send_timeout_ms: 5000,
                persist_timeout_ms: 5000,
                max_message_len: 4000,
            },
            ice: IceConfig {
                stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
                turn: TurnConfig {
                    host: String::new(),
                    secret: String::new(),
                    port: 3478,
                    tls_port: 443,
                    enable_tls: false,
                    credential_ttl: 3600,
                },
            },
            log_level: "info".to_string(),
            history_api: false,
        }
    }
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            port: parse_var("PORT", defaults.port),
            host: env::var("HOST").unwrap_or(defaults.host),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.cors_origins),
            limits: LimitsConfig {
                outbound_queue: parse_var("OUTBOUND_QUEUE", defaults.limits.outbound_queue).max(1),
                send_timeout_ms: parse_var("SEND_TIMEOUT_MS", defaults.limits.send_timeout_ms),
                persist_timeout_ms: parse_var(
                    "PERSIST_TIMEOUT_MS",
                    defaults.limits.persist_timeout_ms,
                ),
                max_message_len: parse_var("MAX_MESSAGE_LEN", defaults.limits.max_message_len),
            },
            ice: IceConfig {
                stun_urls: env::var("STUN_URLS")
                    .map(|v| split_list(&v))
                    .unwrap_or(defaults.ice.stun_urls),
                turn: TurnConfig {
                    host: env::var("TURN_HOST").unwrap_or_default(),
                    secret: env::var("TURN_SECRET").unwrap_or_default(),
                    port: parse_var("TURN_PORT", defaults.ice.turn.port),
                    tls_port: parse_var("TURN_PORT_TLS", defaults.ice.turn.tls_port),
                    enable_tls: parse_flag("TURN_ENABLE_TLS"),
                    credential_ttl: parse_var(
                        "TURN_CREDENTIAL_TTL",
                        defaults.ice.turn.credential_ttl,
                    ),
                },
            },
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            history_api: parse_flag("HISTORY_API"),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag(key: &str) -> bool {
    env::var(key).map(|v| is_truthy(&v)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
