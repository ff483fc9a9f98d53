//! Permission resolution: who is the owner, who administers the host, and
//! who administers a given group.
//!
//! Roles are totally ordered (`Owner > HostAdmin > GroupAdmin > Member`), so
//! `owner ⟹ hostAdmin ⟹ groupAdmin` holds by construction. Group admin
//! status is read from group metadata, which is fetched through the chat
//! client and cached for five minutes per chat.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chorus_core::{
    BoxedChatClient, Chat, ClientResult, GroupMetadata, IdentifierResult, Jid,
};

use crate::error::{PermissionError, PermissionResult};

/// How long group metadata stays cached.
pub const METADATA_TTL: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Roles and requirements
// =============================================================================

/// A sender's standing in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Anyone.
    Member,
    /// Admin of the current group.
    GroupAdmin,
    /// One of the configured host admins.
    HostAdmin,
    /// The configured owner (or the host identity itself).
    Owner,
}

/// What a command demands of its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Sender must be the owner.
    Owner,
    /// Sender must be a host admin (or the owner).
    HostAdmin,
    /// Sender must administer the current group.
    GroupAdmin,
    /// The chat must be a group.
    Group,
    /// The chat must be one-to-one.
    Direct,
    /// No restriction.
    Any,
}

impl Requirement {
    /// Returns the snake_case name of this requirement.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::HostAdmin => "host_admin",
            Self::GroupAdmin => "group_admin",
            Self::Group => "group",
            Self::Direct => "direct",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PermissionResolver
// =============================================================================

struct CachedMetadata {
    metadata: Arc<GroupMetadata>,
    fetched_at: Instant,
}

/// Resolves roles and checks requirements.
pub struct PermissionResolver {
    owner: Option<Jid>,
    admins: Vec<Jid>,
    host: RwLock<Option<Jid>>,
    client: BoxedChatClient,
    cache: RwLock<HashMap<Jid, CachedMetadata>>,
    ttl: Duration,
}

impl PermissionResolver {
    /// Creates a resolver seeded with the configured owner and admins.
    pub fn new(client: BoxedChatClient, owner: Option<Jid>, admins: Vec<Jid>) -> Self {
        let host = client.host_identity();
        Self {
            owner,
            admins,
            host: RwLock::new(host),
            client,
            cache: RwLock::new(HashMap::new()),
            ttl: METADATA_TTL,
        }
    }

    /// Overrides the metadata cache lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Records the host identity once the session reports it.
    pub fn set_host_identity(&self, host: Jid) {
        *self.host.write() = Some(host);
    }

    /// The configured owner.
    pub fn owner(&self) -> Option<&Jid> {
        self.owner.as_ref()
    }

    /// The configured host admins.
    pub fn admins(&self) -> &[Jid] {
        &self.admins
    }

    /// See [`chorus_core::normalize`].
    pub fn normalize(&self, id: &str) -> IdentifierResult<String> {
        chorus_core::normalize(id)
    }

    /// See [`chorus_core::same_user`].
    pub fn same_user(&self, a: &str, b: &str) -> bool {
        chorus_core::same_user(a, b)
    }

    /// Returns `true` for the owner and for the host identity itself.
    pub fn is_owner(&self, sender: &Jid) -> bool {
        let same = |j: &Jid| j.bare_number() == sender.bare_number();
        self.owner.as_ref().is_some_and(same) || self.host.read().as_ref().is_some_and(same)
    }

    /// Returns `true` for host admins (owner included).
    pub fn is_host_admin(&self, sender: &Jid) -> bool {
        self.is_owner(sender)
            || self
                .admins
                .iter()
                .any(|a| a.bare_number() == sender.bare_number())
    }

    /// Resolves the sender's role in `chat`.
    ///
    /// A metadata fetch failure degrades to [`Role::Member`].
    pub async fn role(&self, sender: &Jid, chat: &Chat) -> Role {
        if self.is_owner(sender) {
            return Role::Owner;
        }
        if self.is_host_admin(sender) {
            return Role::HostAdmin;
        }
        if !chat.is_group() {
            return Role::Member;
        }
        match self.group_metadata(&chat.id, false).await {
            Ok(metadata) if metadata.is_admin(sender) => Role::GroupAdmin,
            Ok(_) => Role::Member,
            Err(e) => {
                warn!(chat = %chat, error = %e, "Group metadata unavailable, treating sender as member");
                Role::Member
            }
        }
    }

    /// Checks `required` for `sender` in `chat`.
    pub async fn check_permission(
        &self,
        required: Requirement,
        sender: &Jid,
        chat: &Chat,
    ) -> PermissionResult<()> {
        let allowed = match required {
            Requirement::Any => true,
            Requirement::Group => chat.is_group(),
            Requirement::Direct => !chat.is_group(),
            Requirement::Owner => self.is_owner(sender),
            Requirement::HostAdmin => self.is_host_admin(sender),
            Requirement::GroupAdmin => {
                chat.is_group() && self.role(sender, chat).await >= Role::GroupAdmin
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(PermissionError::NotAuthorized { required })
        }
    }

    /// Returns group metadata, from cache unless `fresh` or expired.
    pub async fn group_metadata(&self, chat: &Jid, fresh: bool) -> ClientResult<Arc<GroupMetadata>> {
        if !fresh {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(chat)
                && entry.fetched_at.elapsed() < self.ttl
            {
                return Ok(Arc::clone(&entry.metadata));
            }
        }

        let metadata = Arc::new(self.client.group_metadata(chat).await?);
        debug!(chat = %chat, participants = metadata.participants.len(), "Group metadata fetched");
        self.cache.write().insert(
            chat.clone(),
            CachedMetadata {
                metadata: Arc::clone(&metadata),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    /// Drops the cached metadata for `chat`.
    pub fn invalidate(&self, chat: &Jid) {
        if self.cache.write().remove(chat).is_some() {
            debug!(chat = %chat, "Group metadata invalidated");
        }
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Number of cached groups.
    pub fn cached_groups(&self) -> usize {
        self.cache.read().len()
    }

    /// Drops expired metadata; returns how many entries were removed.
    pub fn prune(&self) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "Group metadata pruned");
        }
        removed
    }

    /// Runs [`prune`](Self::prune) once per cache lifetime until `cancel`
    /// fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(resolver.ttl.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        resolver.prune();
                    }
                }
            }
            trace!("Group metadata sweeper stopped");
        })
    }
}

impl fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("owner", &self.owner)
            .field("admins", &self.admins)
            .field("cached_groups", &self.cached_groups())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::{AdminRole, MemoryChatClient, Participant};

    use super::*;

    const HOST: &str = "2348000000000";
    const OWNER: &str = "2348011111111";
    const ADMIN: &str = "2348022222222";
    const MOD: &str = "2348033333333";
    const MEMBER: &str = "2348044444444";
    const GROUP: &str = "120363025246125486@g.us";

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn setup() -> (Arc<MemoryChatClient>, PermissionResolver) {
        let client = Arc::new(MemoryChatClient::new(jid(HOST)));
        client.set_group(GroupMetadata {
            id: jid(GROUP),
            subject: "test".into(),
            participants: vec![
                Participant {
                    id: jid(MOD),
                    admin: Some(AdminRole::Admin),
                },
                Participant {
                    id: jid(MEMBER),
                    admin: None,
                },
            ],
        });
        let resolver =
            PermissionResolver::new(client.clone(), Some(jid(OWNER)), vec![jid(ADMIN)]);
        (client, resolver)
    }

    #[tokio::test]
    async fn test_roles_are_ordered() {
        let (_, resolver) = setup();
        let group = Chat::new(jid(GROUP));

        assert_eq!(resolver.role(&jid(OWNER), &group).await, Role::Owner);
        assert_eq!(resolver.role(&jid(HOST), &group).await, Role::Owner);
        assert_eq!(resolver.role(&jid(ADMIN), &group).await, Role::HostAdmin);
        assert_eq!(resolver.role(&jid(MOD), &group).await, Role::GroupAdmin);
        assert_eq!(resolver.role(&jid(MEMBER), &group).await, Role::Member);
        assert!(Role::Owner > Role::HostAdmin && Role::HostAdmin > Role::GroupAdmin);
    }

    #[tokio::test]
    async fn test_device_suffix_does_not_change_identity() {
        let (_, resolver) = setup();
        assert!(resolver.is_owner(&jid("2348011111111:7@s.whatsapp.net")));
        assert!(resolver.same_user("2348011111111@c.us", "+234 801 111 1111"));
    }

    #[tokio::test]
    async fn test_group_checks_fail_outside_groups() {
        let (_, resolver) = setup();
        let direct = Chat::new(jid(MOD));

        let err = resolver
            .check_permission(Requirement::Group, &jid(OWNER), &direct)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PermissionError::NotAuthorized {
                required: Requirement::Group
            }
        );
        assert!(
            resolver
                .check_permission(Requirement::GroupAdmin, &jid(MOD), &direct)
                .await
                .is_err()
        );
        assert!(
            resolver
                .check_permission(Requirement::Direct, &jid(MEMBER), &direct)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_host_admin_requirement() {
        let (_, resolver) = setup();
        let group = Chat::new(jid(GROUP));
        assert!(
            resolver
                .check_permission(Requirement::HostAdmin, &jid(OWNER), &group)
                .await
                .is_ok()
        );
        assert!(
            resolver
                .check_permission(Requirement::HostAdmin, &jid(MOD), &group)
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_is_cached_until_expiry() {
        let (client, resolver) = setup();
        let group = jid(GROUP);

        resolver.group_metadata(&group, false).await.unwrap();
        resolver.group_metadata(&group, false).await.unwrap();
        assert_eq!(client.metadata_calls(), 1);

        resolver.group_metadata(&group, true).await.unwrap();
        assert_eq!(client.metadata_calls(), 2);

        tokio::time::advance(METADATA_TTL + Duration::from_secs(1)).await;
        resolver.group_metadata(&group, false).await.unwrap();
        assert_eq!(client.metadata_calls(), 3);

        resolver.invalidate(&group);
        resolver.group_metadata(&group, false).await.unwrap();
        assert_eq!(client.metadata_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_prunes_expired_metadata() {
        let (_, resolver) = setup();
        let resolver = Arc::new(resolver);
        resolver.group_metadata(&jid(GROUP), false).await.unwrap();
        assert_eq!(resolver.cached_groups(), 1);
        assert_eq!(resolver.prune(), 0);

        let cancel = CancellationToken::new();
        let handle = resolver.spawn_sweeper(cancel.clone());
        tokio::time::sleep(METADATA_TTL * 2 + Duration::from_secs(1)).await;
        assert_eq!(resolver.cached_groups(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_group_degrades_to_member() {
        let (_, resolver) = setup();
        let unknown = Chat::new(jid("120363000000000001@g.us"));
        assert_eq!(resolver.role(&jid(MOD), &unknown).await, Role::Member);
    }
}
