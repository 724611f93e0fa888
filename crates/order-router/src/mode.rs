//! Paper / live mode state with a single-shot confirmation handshake.
//!
//! Entering live mode is two calls in the same session: the first returns
//! `ConfirmationRequired` with a freshly minted token, the second presents
//! that token and flips the mode. A token is consumed on use or replaced
//! by the next unconfirmed attempt.

use tokio::sync::Mutex;
use uuid::Uuid;

use market_core::{CoreError, CoreResult, TradingMode};

#[derive(Debug, Clone, PartialEq)]
pub enum ModeChange {
    Changed(TradingMode),
    ConfirmationRequired { token: String },
}

pub struct ModeManager {
    state: Mutex<ModeState>,
}

struct ModeState {
    mode: TradingMode,
    pending_token: Option<String>,
}

impl Default for ModeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeManager {
    /// Always boots in paper mode.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ModeState {
                mode: TradingMode::Paper,
                pending_token: None,
            }),
        }
    }

    pub async fn current(&self) -> TradingMode {
        self.state.lock().await.mode
    }

    pub async fn request(
        &self,
        target: TradingMode,
        confirmation: Option<&str>,
    ) -> CoreResult<ModeChange> {
        let mut state = self.state.lock().await;

        if state.mode == target {
            return Ok(ModeChange::Changed(target));
        }

        match target {
            // dropping back to paper never needs a handshake
            TradingMode::Paper => {
                state.mode = TradingMode::Paper;
                state.pending_token = None;
                tracing::info!("trading mode set to paper");
                Ok(ModeChange::Changed(TradingMode::Paper))
            }
            TradingMode::Live => match confirmation {
                Some(token)
                    if state
                        .pending_token
                        .as_deref()
                        .is_some_and(|pending| pending == token) =>
                {
                    state.mode = TradingMode::Live;
                    state.pending_token = None;
                    tracing::warn!("trading mode set to LIVE");
                    Ok(ModeChange::Changed(TradingMode::Live))
                }
                Some(_) => Err(CoreError::ConfirmationRequired("live".into())),
                None => {
                    let token = Uuid::new_v4().to_string();
                    state.pending_token = Some(token.clone());
                    Ok(ModeChange::ConfirmationRequired { token })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boots_in_paper_mode() {
        let manager = ModeManager::new();
        assert_eq!(manager.current().await, TradingMode::Paper);
    }

    #[tokio::test]
    async fn live_requires_handshake() {
        let manager = ModeManager::new();

        let first = manager.request(TradingMode::Live, None).await.unwrap();
        let ModeChange::ConfirmationRequired { token } = first else {
            panic!("expected confirmation challenge");
        };
        assert_eq!(manager.current().await, TradingMode::Paper);

        let second = manager
            .request(TradingMode::Live, Some(&token))
            .await
            .unwrap();
        assert_eq!(second, ModeChange::Changed(TradingMode::Live));
        assert_eq!(manager.current().await, TradingMode::Live);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let manager = ModeManager::new();
        manager.request(TradingMode::Live, None).await.unwrap();
        let err = manager
            .request(TradingMode::Live, Some("not-the-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConfirmationRequired(_)));
        assert_eq!(manager.current().await, TradingMode::Paper);
    }

    #[tokio::test]
    async fn token_is_single_shot() {
        let manager = ModeManager::new();
        let ModeChange::ConfirmationRequired { token } =
            manager.request(TradingMode::Live, None).await.unwrap()
        else {
            panic!()
        };
        manager
            .request(TradingMode::Live, Some(&token))
            .await
            .unwrap();
        manager.request(TradingMode::Paper, None).await.unwrap();

        // the consumed token cannot re-enter live mode
        let err = manager
            .request(TradingMode::Live, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConfirmationRequired(_)));
    }

    #[tokio::test]
    async fn paper_to_paper_is_a_no_op() {
        let manager = ModeManager::new();
        let change = manager.request(TradingMode::Paper, None).await.unwrap();
        assert_eq!(change, ModeChange::Changed(TradingMode::Paper));
    }
}
