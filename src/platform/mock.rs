//! In-memory platform for tests and scenario replay.
//!
//! Provides MockPlatformClient with failure injection so the gate can be
//! driven end-to-end without a real chat platform.

use super::traits::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mock platform client bound to a single guild
#[derive(Clone)]
pub struct MockPlatformClient {
    state: Arc<Mutex<MockState>>,
    guild: GuildId,
}

#[derive(Default)]
struct MockState {
    roles: HashMap<RoleId, Role>,
    members: HashMap<UserId, RoleSet>,
    calls: Vec<RoleCall>,
    deny_mutations: bool,
    failing_fetches: u32,
    dropped_adds: u32,
    deferred: HashMap<UserId, RoleSet>,
    delete_on_next_add: Option<RoleId>,
}

/// A recorded role mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCall {
    pub kind: RoleCallKind,
    pub user: UserId,
    pub roles: RoleSet,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleCallKind {
    Add,
    Remove,
}

impl MockPlatformClient {
    /// Create new mock client
    pub fn new(guild: GuildId) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            guild,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a role in the guild catalog
    pub fn create_role(&self, id: RoleId, name: &str) {
        let mut state = self.lock();
        state.roles.insert(
            id,
            Role {
                id,
                name: name.to_string(),
            },
        );
    }

    /// Delete a role from the guild catalog and from every member
    pub fn delete_role(&self, id: RoleId) {
        let mut state = self.lock();
        state.roles.remove(&id);
        for roles in state.members.values_mut() {
            roles.remove(&id);
        }
    }

    /// Put a member in the guild with the given roles
    pub fn add_member(&self, user: UserId, roles: impl IntoIterator<Item = RoleId>) -> MemberView {
        let roles: RoleSet = roles.into_iter().collect();
        let mut state = self.lock();
        state.members.insert(user, roles.clone());
        MemberView { user, roles }
    }

    /// Remove a member from the guild
    pub fn remove_member(&self, user: UserId) {
        let mut state = self.lock();
        state.members.remove(&user);
        state.deferred.remove(&user);
    }

    /// Assign roles out-of-band (a user, an admin or a partner integration).
    ///
    /// Returns the before/after views the platform would publish as a
    /// role-update event, or `None` if the member is absent.
    pub fn assign_roles(
        &self,
        user: UserId,
        roles: impl IntoIterator<Item = RoleId>,
    ) -> Option<(MemberView, MemberView)> {
        let mut state = self.lock();
        let current = state.members.get_mut(&user)?;
        let before = current.clone();
        current.extend(roles);
        let after = current.clone();
        Some((
            MemberView {
                user,
                roles: before,
            },
            MemberView { user, roles: after },
        ))
    }

    /// Revoke roles out-of-band (drift)
    pub fn revoke_roles(
        &self,
        user: UserId,
        roles: impl IntoIterator<Item = RoleId>,
    ) -> Option<(MemberView, MemberView)> {
        let mut state = self.lock();
        let current = state.members.get_mut(&user)?;
        let before = current.clone();
        for role in roles {
            current.remove(&role);
        }
        let after = current.clone();
        Some((
            MemberView {
                user,
                roles: before,
            },
            MemberView { user, roles: after },
        ))
    }

    /// Roles a partner integration will assign just before the next read
    pub fn defer_assignment(&self, user: UserId, roles: impl IntoIterator<Item = RoleId>) {
        let mut state = self.lock();
        state.deferred.entry(user).or_default().extend(roles);
    }

    /// Refuse every role mutation with a permission error
    pub fn deny_mutations(&self, deny: bool) {
        self.lock().deny_mutations = deny;
    }

    /// Delete `role` from the guild just before the next role addition lands
    pub fn delete_role_on_next_add(&self, role: RoleId) {
        self.lock().delete_on_next_add = Some(role);
    }

    /// Fail the next `count` role reads with a transient error
    pub fn fail_next_fetches(&self, count: u32) {
        self.lock().failing_fetches = count;
    }

    /// Accept but silently ignore the next `count` role additions
    pub fn drop_next_adds(&self, count: u32) {
        self.lock().dropped_adds = count;
    }

    /// Current roles of a member, for assertions
    pub fn roles_of(&self, user: UserId) -> Option<RoleSet> {
        self.lock().members.get(&user).cloned()
    }

    /// Check if member is in the guild
    pub fn is_member(&self, user: UserId) -> bool {
        self.lock().members.contains_key(&user)
    }

    /// Recorded role mutations for assertions
    pub fn calls(&self) -> Vec<RoleCall> {
        self.lock().calls.clone()
    }

    /// Recorded role mutations of one kind for one user
    pub fn calls_for(&self, user: UserId, kind: RoleCallKind) -> Vec<RoleCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.user == user && call.kind == kind)
            .cloned()
            .collect()
    }

    fn check_guild(&self, guild: GuildId) -> PlatformResult<()> {
        if guild != self.guild {
            return Err(PlatformError::Protocol(format!("unknown guild {}", guild)));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for MockPlatformClient {
    async fn remove_roles(
        &self,
        guild: GuildId,
        user: UserId,
        roles: &RoleSet,
        reason: &str,
    ) -> PlatformResult<()> {
        self.check_guild(guild)?;
        let mut state = self.lock();
        if state.deny_mutations {
            return Err(PlatformError::Permission("manage roles".to_string()));
        }
        let current = state
            .members
            .get_mut(&user)
            .ok_or(PlatformError::MemberNotFound(user))?;
        for role in roles {
            current.remove(role);
        }
        state.calls.push(RoleCall {
            kind: RoleCallKind::Remove,
            user,
            roles: roles.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn add_roles(
        &self,
        guild: GuildId,
        user: UserId,
        roles: &RoleSet,
        reason: &str,
    ) -> PlatformResult<()> {
        self.check_guild(guild)?;
        let mut state = self.lock();
        if state.deny_mutations {
            return Err(PlatformError::Permission("manage roles".to_string()));
        }
        if !state.members.contains_key(&user) {
            return Err(PlatformError::MemberNotFound(user));
        }
        if let Some(deleted) = state.delete_on_next_add.take() {
            state.roles.remove(&deleted);
            for roles in state.members.values_mut() {
                roles.remove(&deleted);
            }
        }
        if let Some(missing) = roles.iter().find(|role| !state.roles.contains_key(*role)) {
            return Err(PlatformError::RoleNotFound(*missing));
        }
        state.calls.push(RoleCall {
            kind: RoleCallKind::Add,
            user,
            roles: roles.clone(),
            reason: reason.to_string(),
        });
        if state.dropped_adds > 0 {
            // Accepted by the API, reverted platform-side
            state.dropped_adds -= 1;
            return Ok(());
        }
        if let Some(current) = state.members.get_mut(&user) {
            current.extend(roles.iter().copied());
        }
        Ok(())
    }

    async fn fetch_live_roles(&self, guild: GuildId, user: UserId) -> PlatformResult<RoleSet> {
        self.check_guild(guild)?;
        let mut state = self.lock();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(PlatformError::Transient("gateway timeout".to_string()));
        }
        let deferred = state.deferred.remove(&user);
        let current = state
            .members
            .get_mut(&user)
            .ok_or(PlatformError::MemberNotFound(user))?;
        if let Some(deferred) = deferred {
            current.extend(deferred);
        }
        Ok(current.clone())
    }

    async fn is_member_present(&self, guild: GuildId, user: UserId) -> PlatformResult<bool> {
        self.check_guild(guild)?;
        Ok(self.lock().members.contains_key(&user))
    }

    async fn resolve_role(&self, guild: GuildId, role: RoleId) -> PlatformResult<Option<Role>> {
        self.check_guild(guild)?;
        Ok(self.lock().roles.get(&role).cloned())
    }
}

/// Audit source that always attributes changes to the same actor
#[derive(Debug, Clone)]
pub struct StaticAuditSource {
    source: Option<SourceDescription>,
    fail: bool,
}

impl StaticAuditSource {
    pub fn new(source: &str) -> Self {
        Self {
            source: Some(SourceDescription(source.to_string())),
            fail: false,
        }
    }

    /// An audit source whose lookups always error
    pub fn failing() -> Self {
        Self {
            source: None,
            fail: true,
        }
    }
}

#[async_trait]
impl AuditSource for StaticAuditSource {
    async fn role_change_source(
        &self,
        _guild: GuildId,
        _user: UserId,
        _roles: &RoleSet,
    ) -> PlatformResult<Option<SourceDescription>> {
        if self.fail {
            return Err(PlatformError::Permission("view audit log".to_string()));
        }
        Ok(self.source.clone())
    }
}
