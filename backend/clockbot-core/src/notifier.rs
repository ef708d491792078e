// src/notifier.rs

use async_trait::async_trait;
use slack_morphism::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Slack client setup failed: {0}")]
    Client(String),
    #[error("Could not open a direct conversation with {user_id}: {message}")]
    OpenConversation { user_id: String, message: String },
    #[error("Could not post message to {channel}: {message}")]
    PostMessage { channel: String, message: String },
}

/// Chat delivery boundary: one direct message to one user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_direct_message(&self, user_id: &str, text: &str)
        -> Result<(), NotificationError>;
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Box<N> {
    async fn send_direct_message(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<(), NotificationError> {
        (**self).send_direct_message(user_id, text).await
    }
}

pub struct SlackNotifier {
    client: SlackHyperClient,
    token: SlackApiToken,
}

impl SlackNotifier {
    pub fn new(bot_token: &str) -> Result<Self, NotificationError> {
        let connector =
            SlackClientHyperConnector::new().map_err(|e| NotificationError::Client(e.to_string()))?;
        let token_value: SlackApiTokenValue = bot_token.to_string().into();
        Ok(Self {
            client: SlackClient::new(connector),
            token: SlackApiToken::new(token_value),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send_direct_message(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<(), NotificationError> {
        let session = self.client.open_session(&self.token);

        let slack_user: SlackUserId = user_id.to_string().into();
        let open_request = SlackApiConversationsOpenRequest::new().with_users(vec![slack_user]);
        let conversation = session
            .conversations_open(&open_request)
            .await
            .map_err(|e| NotificationError::OpenConversation {
                user_id: user_id.to_string(),
                message: e.to_string(),
            })?;
        let channel = conversation.channel.id;
        debug!("Direct conversation with {} is {:?}", user_id, channel);

        let post_request = SlackApiChatPostMessageRequest::new(
            channel.clone(),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        session
            .chat_post_message(&post_request)
            .await
            .map_err(|e| NotificationError::PostMessage {
                channel: format!("{:?}", channel),
                message: e.to_string(),
            })?;

        info!("Direct message delivered to {}", user_id);
        Ok(())
    }
}

/// Logs the message instead of sending it.
pub struct DryRunNotifier;

#[async_trait]
impl Notifier for DryRunNotifier {
    async fn send_direct_message(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<(), NotificationError> {
        info!("[dry run] Message for {}:\n{}", user_id, text);
        Ok(())
    }
}
