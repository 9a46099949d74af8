//! Chorus 실시간 세션 릴레이
//!
//! 연결 ↔ 사용자 신원 추적, 서버/채널 방 멀티캐스트, 채팅 메시지 저장 후 전파,
//! WebRTC 시그널링 중계를 담당한다. 미디어는 다루지 않는다.

pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::{DeliveryFailure, RelayError};
pub use state::AppState;
