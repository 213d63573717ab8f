//! Avatar renderer seam
//!
//! The renderer only sees hints and persona switches. [`run_avatar_bridge`]
//! feeds it from the controller's lifecycle broadcast so a slow renderer
//! never holds up the pipeline.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::turn::LifecycleEvent;

/// Something that shows the avatar
#[async_trait]
pub trait AvatarRenderer: Send {
    /// Show the animation for `hint`
    async fn set_state(&mut self, hint: &str);

    /// Switch to the asset set in `directory` with clip `prefix`
    async fn set_persona(&mut self, directory: &str, prefix: &str);
}

/// Renderer that only logs what it would show
#[derive(Debug, Default)]
pub struct LogAvatar;

#[async_trait]
impl AvatarRenderer for LogAvatar {
    async fn set_state(&mut self, hint: &str) {
        tracing::info!(%hint, "avatar state");
    }

    async fn set_persona(&mut self, directory: &str, prefix: &str) {
        tracing::info!(%directory, %prefix, "avatar persona");
    }
}

/// Apply lifecycle events to `renderer` until the broadcast closes
///
/// Repeating the active hint is suppressed; a persona switch clears it so
/// the next hint always applies.
pub async fn run_avatar_bridge<R>(mut renderer: R, mut events: broadcast::Receiver<LifecycleEvent>)
where
    R: AvatarRenderer,
{
    let mut current: Option<String> = None;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "avatar bridge lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            LifecycleEvent::AvatarState(hint) => {
                if current.as_deref() == Some(hint.as_str()) {
                    continue;
                }
                renderer.set_state(&hint).await;
                current = Some(hint);
            }
            LifecycleEvent::AvatarPersona { directory, prefix } => {
                renderer.set_persona(&directory, &prefix).await;
                current = None;
            }
            _ => {}
        }
    }
    tracing::debug!("avatar bridge stopped");
}
