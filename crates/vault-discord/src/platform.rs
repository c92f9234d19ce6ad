use std::sync::Arc;

use async_trait::async_trait;
use serenity::builder::{EditMember, EditMessage};
use serenity::http::Http;
use serenity::model::channel::{PermissionOverwrite, PermissionOverwriteType};
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use serenity::model::permissions::Permissions;
use tracing::{debug, info};
use vault_core::config::DiscordConfig;
use vault_core::{
    ChannelId as VaultChannelId, ContextId, NoticeRef, Platform, PlatformError, PrivilegeId,
    Subject, SubjectId,
};

use crate::error::DiscordError;

const AUDIT_REASON: &str = "vault: scheduled privilege change";

/// [`Platform`] over Discord's REST API.
pub struct DiscordPlatform {
    http: Arc<Http>,
    guilds: Vec<GuildId>,
}

impl DiscordPlatform {
    /// Build from config. `guild_ids` limits the contexts searched for
    /// records that lack one; when empty every guild the bot is in is used.
    pub fn new(config: &DiscordConfig) -> Result<Self, DiscordError> {
        if config.bot_token.trim().is_empty() {
            return Err(DiscordError::NoToken);
        }
        let guilds = config
            .guild_ids
            .iter()
            .filter(|id| **id != 0)
            .map(|id| GuildId::new(*id))
            .collect();
        Ok(Self {
            http: Arc::new(Http::new(&config.bot_token)),
            guilds,
        })
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }
}

/// Map a serenity failure onto the capability taxonomy: HTTP 404 means the
/// object is gone, anything else may succeed on a later sweep.
pub(crate) fn classify(err: serenity::Error) -> PlatformError {
    let status = match &err {
        serenity::Error::Http(http) => http.status_code().map(|s| s.as_u16()),
        _ => None,
    };
    if is_not_found_status(status) {
        PlatformError::NotFound(err.to_string())
    } else {
        PlatformError::Transient(err.to_string())
    }
}

fn is_not_found_status(status: Option<u16>) -> bool {
    status == Some(404)
}

fn snowflake(kind: &'static str, raw: &str) -> Result<u64, DiscordError> {
    match raw.trim().parse::<u64>() {
        Ok(id) if id != 0 => Ok(id),
        _ => Err(DiscordError::InvalidId {
            kind,
            raw: raw.to_string(),
        }),
    }
}

fn guild_id(context: &ContextId) -> Result<GuildId, DiscordError> {
    snowflake("guild", context.as_str()).map(GuildId::new)
}

fn user_id(subject: &SubjectId) -> Result<UserId, DiscordError> {
    snowflake("user", subject.as_str()).map(UserId::new)
}

fn role_id(privilege: &PrivilegeId) -> Result<RoleId, DiscordError> {
    snowflake("role", privilege.as_str()).map(RoleId::new)
}

fn channel_id(channel: &VaultChannelId) -> Result<ChannelId, DiscordError> {
    snowflake("channel", channel.as_str()).map(ChannelId::new)
}

fn member_ids(subject: &Subject) -> Result<(GuildId, UserId), DiscordError> {
    Ok((guild_id(&subject.context)?, user_id(&subject.id)?))
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn contexts(&self) -> Result<Vec<ContextId>, PlatformError> {
        if !self.guilds.is_empty() {
            return Ok(self
                .guilds
                .iter()
                .map(|g| ContextId::from(g.to_string()))
                .collect());
        }
        let guilds = self.http.get_guilds(None, None).await.map_err(classify)?;
        Ok(guilds
            .into_iter()
            .map(|g| ContextId::from(g.id.to_string()))
            .collect())
    }

    async fn find_subject(
        &self,
        subject: &SubjectId,
        context: &ContextId,
    ) -> Result<Subject, PlatformError> {
        let guild = guild_id(context)?;
        let user = user_id(subject)?;
        let member = self.http.get_member(guild, user).await.map_err(classify)?;
        debug!(guild = %guild, user = %member.user.id, "member found");
        Ok(Subject {
            id: subject.clone(),
            context: context.clone(),
        })
    }

    async fn grant_privilege(
        &self,
        subject: &Subject,
        privilege: &PrivilegeId,
    ) -> Result<(), PlatformError> {
        let (guild, user) = member_ids(subject)?;
        let role = role_id(privilege)?;
        self.http
            .add_member_role(guild, user, role, Some(AUDIT_REASON))
            .await
            .map_err(classify)?;
        info!(guild = %guild, user = %user, role = %role, "discord: role added");
        Ok(())
    }

    async fn revoke_privilege(
        &self,
        subject: &Subject,
        privilege: &PrivilegeId,
    ) -> Result<(), PlatformError> {
        let (guild, user) = member_ids(subject)?;
        let role = role_id(privilege)?;
        self.http
            .remove_member_role(guild, user, role, Some(AUDIT_REASON))
            .await
            .map_err(classify)?;
        info!(guild = %guild, user = %user, role = %role, "discord: role removed");
        Ok(())
    }

    async fn override_display_name(
        &self,
        subject: &Subject,
        value: Option<&str>,
    ) -> Result<(), PlatformError> {
        let (guild, user) = member_ids(subject)?;
        // An empty nickname clears the override.
        let builder = EditMember::new().nickname(value.unwrap_or(""));
        guild
            .edit_member(self.http.as_ref(), user, builder)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn deliver_notice(
        &self,
        _context: &ContextId,
        channel: &VaultChannelId,
        message: &str,
    ) -> Result<Option<NoticeRef>, PlatformError> {
        let channel_id = channel_id(channel)?;
        let sent = channel_id
            .say(self.http.as_ref(), message)
            .await
            .map_err(classify)?;
        Ok(Some(NoticeRef {
            channel: channel.clone(),
            message_id: sent.id.to_string(),
        }))
    }

    async fn edit_notice(&self, notice: &NoticeRef, message: &str) -> Result<(), PlatformError> {
        let channel = channel_id(&notice.channel)?;
        let message_id = MessageId::new(snowflake("message", &notice.message_id)?);
        channel
            .edit_message(
                self.http.as_ref(),
                message_id,
                EditMessage::new().content(message),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn set_channel_locked(
        &self,
        context: &ContextId,
        channel: &VaultChannelId,
        locked: bool,
    ) -> Result<(), PlatformError> {
        let guild = guild_id(context)?;
        let channel_id = channel_id(channel)?;
        // The @everyone role shares the guild's id.
        let everyone = RoleId::new(guild.get());
        let overwrite = if locked {
            PermissionOverwrite {
                allow: Permissions::empty(),
                deny: Permissions::SEND_MESSAGES,
                kind: PermissionOverwriteType::Role(everyone),
            }
        } else {
            PermissionOverwrite {
                allow: Permissions::SEND_MESSAGES,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Role(everyone),
            }
        };
        channel_id
            .create_permission(self.http.as_ref(), overwrite)
            .await
            .map_err(classify)?;
        info!(channel = %channel_id, locked, "discord: channel permissions updated");
        Ok(())
    }
}
