//! Discord platform adapter.
//!
//! [`DiscordHandler`] bridges serenity gateway events into the event bus:
//! inbound DMs become `dm.incoming` events and the delivery offset advances
//! once the publish is durable. [`DiscordApi`] is the REST surface the
//! worker-side handlers use (fetch, send, react, typing).

use std::sync::Arc;

use async_trait::async_trait;
use serenity::all::{
    Channel, ChannelId, ConnectionStage, Context, CreateAttachment, CreateMessage, EventHandler,
    GetMessages, Message, MessageId, Ready, ResumedEvent, ShardStageUpdateEvent, UserId,
};
use serenity::http::HttpError;
use tracing::{info, warn};

use crate::connection::ConnectionSupervisor;
use crate::events::{
    DmIncomingPayload, EventInput, EventStore, EventType, FileDescriptor, Lane,
};

/// Priority of a freshly delivered DM within the interactive lane. The
/// reconcile sweep republishes at a higher priority so repairs jump ahead.
pub const INBOUND_PRIORITY: i64 = 10;

/// Discord error codes after which a retry can never succeed:
/// unknown channel, unknown message, missing access, missing permissions.
const TERMINAL_DISCORD_CODES: [isize; 4] = [10003, 10008, 50001, 50013];

/// Extract the Discord JSON error code from an error chain, if any.
pub fn discord_error_code(err: &anyhow::Error) -> Option<isize> {
    for cause in err.chain() {
        if let Some(serenity::Error::Http(HttpError::UnsuccessfulRequest(resp))) =
            cause.downcast_ref::<serenity::Error>()
        {
            return Some(resp.error.code);
        }
    }
    None
}

pub fn is_terminal_discord_code(code: isize) -> bool {
    TERMINAL_DISCORD_CODES.contains(&code)
}

/// Serenity event handler feeding the event bus.
pub struct DiscordHandler {
    supervisor: Arc<ConnectionSupervisor>,
    events: Arc<EventStore>,
    allowed_user_ids: Vec<u64>,
}

impl DiscordHandler {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        events: Arc<EventStore>,
        allowed_user_ids: Vec<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            events,
            allowed_user_ids,
        })
    }

    async fn publish_recovery_sweep(&self) {
        let input = EventInput::new(
            EventType::DmRecoverRun,
            Lane::System,
            0,
            serde_json::json!({}),
        );
        if let Err(e) = self.events.publish(input).await {
            warn!("Failed to publish recovery sweep: {}", e);
        }
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, data: Ready) {
        info!(username = %data.user.name, "Discord gateway ready");
        self.supervisor.notify_ready();
        self.publish_recovery_sweep().await;
    }

    async fn resume(&self, _ctx: Context, _event: ResumedEvent) {
        info!("Discord session resumed");
        self.supervisor.notify_ready();
        self.publish_recovery_sweep().await;
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        if event.new == ConnectionStage::Disconnected {
            warn!(shard = %event.shard_id, "Shard disconnected");
            self.supervisor.notify_disconnected();
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        // DMs only; group channels are out of scope.
        if msg.guild_id.is_some() || msg.author.bot {
            return;
        }
        let author_id = msg.author.id.get();
        if !self.allowed_user_ids.contains(&author_id) {
            warn!(author_id, "Ignoring DM from non-allowlisted user");
            return;
        }
        if msg.content.trim().is_empty() && msg.attachments.is_empty() {
            return;
        }

        let payload = DmIncomingPayload {
            message_id: msg.id.get().to_string(),
            channel_id: msg.channel_id.get().to_string(),
            author_id: author_id.to_string(),
        };
        let input = EventInput::new(
            EventType::DmIncoming,
            Lane::Interactive,
            INBOUND_PRIORITY,
            match serde_json::to_value(&payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Failed to encode inbound payload: {}", e);
                    return;
                }
            },
        );

        match self.events.publish(input).await {
            Ok(event_id) => {
                info!(event_id, message_id = %payload.message_id, "Inbound DM queued");
                // Advance the watermark only after the enqueue is durable so
                // a store hiccup cannot skip the message.
                let scope = format!("dm_user:{}", author_id);
                if let Err(e) = self
                    .events
                    .update_offset(&scope, &payload.message_id)
                    .await
                {
                    warn!(scope, "Failed to advance DM offset: {}", e);
                }
            }
            Err(e) => {
                warn!(message_id = %payload.message_id, "Failed to enqueue inbound DM: {}", e);
            }
        }
    }
}

/// REST operations for the worker-side handlers. All calls go through the
/// supervisor's current HTTP handle, so a reconnect transparently swaps the
/// underlying client.
#[derive(Clone)]
pub struct DiscordApi {
    supervisor: Arc<ConnectionSupervisor>,
}

impl DiscordApi {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Fetch a channel and require it to be DM-capable.
    pub async fn fetch_dm_channel(&self, channel_id: u64) -> anyhow::Result<ChannelId> {
        let http = self.supervisor.http()?;
        let channel = http.get_channel(ChannelId::new(channel_id)).await?;
        match channel {
            Channel::Private(private) => Ok(private.id),
            _ => anyhow::bail!("channel {} is not DM-capable", channel_id),
        }
    }

    pub async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: u64,
    ) -> anyhow::Result<Message> {
        let http = self.supervisor.http()?;
        let msg = channel_id.message(&http, MessageId::new(message_id)).await?;
        Ok(msg)
    }

    pub async fn react(
        &self,
        channel_id: ChannelId,
        message_id: u64,
        emoji: &str,
    ) -> anyhow::Result<()> {
        let http = self.supervisor.http()?;
        let reaction = serenity::all::ReactionType::Unicode(emoji.to_string());
        channel_id
            .create_reaction(&http, MessageId::new(message_id), reaction)
            .await?;
        Ok(())
    }

    pub async fn say(&self, channel_id: ChannelId, text: &str) -> anyhow::Result<()> {
        let http = self.supervisor.http()?;
        channel_id.say(&http, text).await?;
        Ok(())
    }

    /// Send one composite message: optional text plus every file.
    pub async fn send_with_files(
        &self,
        channel_id: ChannelId,
        text: Option<&str>,
        files: &[FileDescriptor],
    ) -> anyhow::Result<()> {
        let http = self.supervisor.http()?;
        let mut message = CreateMessage::new();
        if let Some(text) = text {
            message = message.content(text);
        }
        for file in files {
            let data = tokio::fs::read(&file.path).await.map_err(|e| {
                anyhow::anyhow!("failed to read attachment {}: {}", file.path, e)
            })?;
            message = message.add_file(CreateAttachment::bytes(data, file.name.as_str()));
        }
        channel_id.send_message(&http, message).await?;
        Ok(())
    }

    pub async fn broadcast_typing(&self, channel_id: ChannelId) -> anyhow::Result<()> {
        let http = self.supervisor.http()?;
        channel_id.broadcast_typing(&http).await?;
        Ok(())
    }

    /// Resolve the DM channel for a user (creating it if necessary).
    pub async fn dm_channel_for_user(&self, user_id: u64) -> anyhow::Result<ChannelId> {
        let http = self.supervisor.http()?;
        let channel = UserId::new(user_id).create_dm_channel(&http).await?;
        Ok(channel.id)
    }

    /// Page of messages strictly after `after`, oldest first.
    pub async fn messages_after(
        &self,
        channel_id: ChannelId,
        after: u64,
        limit: u8,
    ) -> anyhow::Result<Vec<Message>> {
        let http = self.supervisor.http()?;
        let mut messages = channel_id
            .messages(&http, GetMessages::new().after(MessageId::new(after)).limit(limit))
            .await?;
        messages.sort_by_key(|m| m.id.get());
        Ok(messages)
    }

    /// The newest message id in a channel, if any.
    pub async fn latest_message_id(&self, channel_id: ChannelId) -> anyhow::Result<Option<u64>> {
        let http = self.supervisor.http()?;
        let messages = channel_id
            .messages(&http, GetMessages::new().limit(1))
            .await?;
        Ok(messages.first().map(|m| m.id.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_code_set() {
        for code in [10003, 10008, 50001, 50013] {
            assert!(is_terminal_discord_code(code));
        }
        assert!(!is_terminal_discord_code(10004));
        assert!(!is_terminal_discord_code(0));
    }

    #[test]
    fn plain_errors_have_no_discord_code() {
        let err = anyhow::anyhow!("just text");
        assert_eq!(discord_error_code(&err), None);
    }
}
