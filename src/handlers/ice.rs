//! ICE 서버 설정 핸들러 (STUN + TURN 임시 자격증명)

use crate::config::IceConfig;
use crate::error::RelayError;
use crate::protocol::{IceServer, ServerMessage};
use crate::state::{AppState, ConnectionId};
use crate::store::UserId;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// `request-ice-servers` 처리
pub fn handle_ice_request(state: &AppState, connection_id: ConnectionId) -> Result<(), RelayError> {
    let user = state.hub().identity_of(connection_id)?;
    let ice = &state.config.ice;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let ice_servers = build_ice_servers(ice, user.id, now);

    tracing::debug!(
        connection_id = %connection_id,
        servers = ice_servers.len(),
        turn = ice.turn.is_configured(),
        "ICE servers sent"
    );
    state.hub().send_to(
        connection_id,
        ServerMessage::IceServers {
            ice_servers,
            ttl: ice.turn.credential_ttl,
        },
    );
    Ok(())
}

/// TURN REST 자격증명: username = `<만료시각>:<userId>`, credential = base64(HMAC-SHA1)
fn turn_credentials(secret: &str, user_id: UserId, expires_at: u64) -> Option<(String, String)> {
    let username = format!("{expires_at}:{user_id}");
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(username.as_bytes());
    let credential = BASE64.encode(mac.finalize().into_bytes());
    Some((username, credential))
}

fn build_ice_servers(config: &IceConfig, user_id: UserId, now: u64) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = config
        .stun_urls
        .iter()
        .map(|url| IceServer {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        })
        .collect();

    let turn = &config.turn;
    if !turn.is_configured() {
        return servers;
    }
    let Some((username, credential)) =
        turn_credentials(&turn.secret, user_id, now + turn.credential_ttl)
    else {
        return servers;
    };

    let mut urls = vec![
        format!("turn:{}:{}?transport=udp", turn.host, turn.port),
        format!("turn:{}:{}?transport=tcp", turn.host, turn.port),
    ];
    if turn.enable_tls {
        urls.push(format!("turns:{}:{}?transport=tcp", turn.host, turn.tls_port));
    }

    servers.push(IceServer {
        urls,
        username: Some(username),
        credential: Some(credential),
    });
    servers
}
