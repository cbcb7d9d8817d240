//! Two independent permission universes and the pure resolution rules.
//!
//! System permissions govern application-wide capability; conversation
//! permissions govern capability inside one conversation. The two bit
//! layouts share nothing, and a bit position in one universe means nothing
//! in the other. Composites are plain bitwise unions of finer bits, so
//! checking a composite is always equivalent to checking each member bit.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPermission {
    SendMessage,
    CreateDirectChat,
    CreateGroup,
    JoinGroup,
    UploadFile,
    DownloadFile,
    DeleteOwnFile,
    AddGroupMember,
    RemoveGroupMember,
    DeleteGroup,
    EditGroupInfo,
    DeleteOwnMessage,
    DeleteAnyMessage,
    EditOwnMessage,
    EditAnyMessage,
    MuteUser,
    BanUser,
    ViewMessageHistory,
    ManageUsers,
    ManageRoles,
    ViewSystemLogs,
    ManageSystem,
    DeleteAnyConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemPermissionSet(u64);

impl SystemPermissionSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, permission: SystemPermission) -> bool {
        self.0 & system_permission_mask(permission) != 0
    }

    #[must_use]
    pub const fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, permission: SystemPermission) {
        self.0 |= system_permission_mask(permission);
    }

    pub fn remove(&mut self, permission: SystemPermission) {
        self.0 &= !system_permission_mask(permission);
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPermission {
    ViewMessages,
    SendMessages,
    SendMedia,
    SendVoice,
    React,
    ForwardMessages,
    DeleteOwnMessages,
    EditOwnMessages,
    DeleteAnyMessage,
    EditAnyMessage,
    PinMessages,
    ViewMembers,
    AddMembers,
    RemoveMembers,
    MuteMembers,
    ChangeNicknames,
    EditConversationInfo,
    ManageRoles,
    ManagePermissions,
    CreatePolls,
    ViewMessageHistory,
    ExportChat,
    DeleteConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationPermissionSet(u64);

impl ConversationPermissionSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, permission: ConversationPermission) -> bool {
        self.0 & conversation_permission_mask(permission) != 0
    }

    #[must_use]
    pub const fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, permission: ConversationPermission) {
        self.0 |= conversation_permission_mask(permission);
    }

    pub fn remove(&mut self, permission: ConversationPermission) {
        self.0 &= !conversation_permission_mask(permission);
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

fn system_permission_mask(permission: SystemPermission) -> u64 {
    match permission {
        SystemPermission::SendMessage => 1 << 0,
        SystemPermission::CreateDirectChat => 1 << 1,
        SystemPermission::CreateGroup => 1 << 2,
        SystemPermission::JoinGroup => 1 << 3,
        SystemPermission::UploadFile => 1 << 4,
        SystemPermission::DownloadFile => 1 << 5,
        SystemPermission::DeleteOwnFile => 1 << 6,
        SystemPermission::AddGroupMember => 1 << 7,
        SystemPermission::RemoveGroupMember => 1 << 8,
        SystemPermission::DeleteGroup => 1 << 9,
        SystemPermission::EditGroupInfo => 1 << 10,
        SystemPermission::DeleteOwnMessage => 1 << 11,
        SystemPermission::DeleteAnyMessage => 1 << 12,
        SystemPermission::EditOwnMessage => 1 << 13,
        SystemPermission::EditAnyMessage => 1 << 14,
        SystemPermission::MuteUser => 1 << 15,
        SystemPermission::BanUser => 1 << 16,
        SystemPermission::ViewMessageHistory => 1 << 17,
        SystemPermission::ManageUsers => 1 << 18,
        SystemPermission::ManageRoles => 1 << 19,
        SystemPermission::ViewSystemLogs => 1 << 20,
        SystemPermission::ManageSystem => 1 << 21,
        SystemPermission::DeleteAnyConversation => 1 << 22,
    }
}

fn conversation_permission_mask(permission: ConversationPermission) -> u64 {
    match permission {
        ConversationPermission::ViewMessages => 1 << 0,
        ConversationPermission::SendMessages => 1 << 1,
        ConversationPermission::SendMedia => 1 << 2,
        ConversationPermission::SendVoice => 1 << 3,
        ConversationPermission::React => 1 << 4,
        ConversationPermission::ForwardMessages => 1 << 5,
        ConversationPermission::DeleteOwnMessages => 1 << 6,
        ConversationPermission::EditOwnMessages => 1 << 7,
        ConversationPermission::DeleteAnyMessage => 1 << 8,
        ConversationPermission::EditAnyMessage => 1 << 9,
        ConversationPermission::PinMessages => 1 << 10,
        ConversationPermission::ViewMembers => 1 << 11,
        ConversationPermission::AddMembers => 1 << 12,
        ConversationPermission::RemoveMembers => 1 << 13,
        ConversationPermission::MuteMembers => 1 << 14,
        ConversationPermission::ChangeNicknames => 1 << 15,
        ConversationPermission::EditConversationInfo => 1 << 16,
        ConversationPermission::ManageRoles => 1 << 17,
        ConversationPermission::ManagePermissions => 1 << 18,
        ConversationPermission::CreatePolls => 1 << 19,
        ConversationPermission::ViewMessageHistory => 1 << 20,
        ConversationPermission::ExportChat => 1 << 21,
        ConversationPermission::DeleteConversation => 1 << 22,
    }
}

/// Every bit the system universe currently defines. Unknown bits are never
/// granted through composites; `SuperAdmin` is this mask, not `u64::MAX`.
pub const SYSTEM_KNOWN_MASK: u64 = (1 << 23) - 1;

/// Every bit the conversation universe currently defines.
pub const CONVERSATION_KNOWN_MASK: u64 = (1 << 23) - 1;

/// Splits raw client-supplied bits into the known portion and the rejected
/// remainder.
#[must_use]
pub const fn mask_system_bits(bits: u64) -> (SystemPermissionSet, u64) {
    (
        SystemPermissionSet::from_bits(bits & SYSTEM_KNOWN_MASK),
        bits & !SYSTEM_KNOWN_MASK,
    )
}

#[must_use]
pub const fn mask_conversation_bits(bits: u64) -> (ConversationPermissionSet, u64) {
    (
        ConversationPermissionSet::from_bits(bits & CONVERSATION_KNOWN_MASK),
        bits & !CONVERSATION_KNOWN_MASK,
    )
}

#[must_use]
pub fn basic_user() -> SystemPermissionSet {
    let mut set = SystemPermissionSet::empty();
    set.insert(SystemPermission::SendMessage);
    set.insert(SystemPermission::CreateDirectChat);
    set.insert(SystemPermission::JoinGroup);
    set.insert(SystemPermission::UploadFile);
    set.insert(SystemPermission::DownloadFile);
    set.insert(SystemPermission::DeleteOwnFile);
    set.insert(SystemPermission::DeleteOwnMessage);
    set.insert(SystemPermission::EditOwnMessage);
    set
}

#[must_use]
pub fn group_moderator() -> SystemPermissionSet {
    let mut set = basic_user();
    set.insert(SystemPermission::CreateGroup);
    set.insert(SystemPermission::AddGroupMember);
    set.insert(SystemPermission::RemoveGroupMember);
    set.insert(SystemPermission::EditGroupInfo);
    set.insert(SystemPermission::DeleteAnyMessage);
    set.insert(SystemPermission::MuteUser);
    set.insert(SystemPermission::ViewMessageHistory);
    set
}

#[must_use]
pub fn administrator() -> SystemPermissionSet {
    let mut set = group_moderator();
    set.insert(SystemPermission::DeleteGroup);
    set.insert(SystemPermission::EditAnyMessage);
    set.insert(SystemPermission::BanUser);
    set.insert(SystemPermission::ManageUsers);
    set.insert(SystemPermission::ManageRoles);
    set.insert(SystemPermission::ViewSystemLogs);
    set.insert(SystemPermission::ManageSystem);
    set.insert(SystemPermission::DeleteAnyConversation);
    set
}

#[must_use]
pub const fn super_admin() -> SystemPermissionSet {
    SystemPermissionSet::from_bits(SYSTEM_KNOWN_MASK)
}

#[must_use]
pub fn read_only() -> ConversationPermissionSet {
    let mut set = ConversationPermissionSet::empty();
    set.insert(ConversationPermission::ViewMessages);
    set.insert(ConversationPermission::ViewMembers);
    set
}

#[must_use]
pub fn basic_member() -> ConversationPermissionSet {
    let mut set = read_only();
    set.insert(ConversationPermission::SendMessages);
    set.insert(ConversationPermission::SendMedia);
    set.insert(ConversationPermission::React);
    set.insert(ConversationPermission::ForwardMessages);
    set.insert(ConversationPermission::DeleteOwnMessages);
    set.insert(ConversationPermission::EditOwnMessages);
    set.insert(ConversationPermission::ViewMessageHistory);
    set
}

#[must_use]
pub fn conversation_moderator() -> ConversationPermissionSet {
    let mut set = basic_member();
    set.insert(ConversationPermission::DeleteAnyMessage);
    set.insert(ConversationPermission::PinMessages);
    set.insert(ConversationPermission::MuteMembers);
    set.insert(ConversationPermission::ChangeNicknames);
    set
}

#[must_use]
pub fn conversation_admin() -> ConversationPermissionSet {
    let mut set = conversation_moderator();
    set.insert(ConversationPermission::AddMembers);
    set.insert(ConversationPermission::RemoveMembers);
    set.insert(ConversationPermission::EditConversationInfo);
    set.insert(ConversationPermission::ManageRoles);
    set.insert(ConversationPermission::EditAnyMessage);
    set.insert(ConversationPermission::ExportChat);
    set
}

#[must_use]
pub fn conversation_owner() -> ConversationPermissionSet {
    let mut set = conversation_admin();
    set.insert(ConversationPermission::ManagePermissions);
    set.insert(ConversationPermission::DeleteConversation);
    set
}

#[must_use]
pub fn rank_default_permissions(role: crate::ConversationRole) -> ConversationPermissionSet {
    match role {
        crate::ConversationRole::Member => basic_member(),
        crate::ConversationRole::Moderator => conversation_moderator(),
        crate::ConversationRole::Admin => conversation_admin(),
        crate::ConversationRole::Owner => conversation_owner(),
    }
}

/// System-level resolution. The per-user override, when present, REPLACES
/// the baseline rather than extending it; the overrides of the user's
/// active roles are then unioned in. Order matters: a role grant can lift a
/// user back above an explicit restriction, and a restriction alone can
/// carry a user below the default.
#[must_use]
pub fn resolve_system_permissions(
    user_override: Option<SystemPermissionSet>,
    role_overrides: &[SystemPermissionSet],
) -> SystemPermissionSet {
    let mut effective = user_override.unwrap_or_else(basic_user);
    for role in role_overrides {
        effective = effective.union(*role);
    }
    effective
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub active: bool,
    pub role: crate::ConversationRole,
}

/// Conversation-level resolution. A missing or invalidated membership
/// resolves to the empty set; direct conversations pin both peers to the
/// basic-member composite and ignore any stored override; otherwise a
/// stored per-rank override wins verbatim over the compiled-in default.
#[must_use]
pub fn resolve_conversation_permissions(
    kind: crate::ConversationKind,
    membership: Option<MembershipSnapshot>,
    rank_override: Option<ConversationPermissionSet>,
) -> ConversationPermissionSet {
    let Some(membership) = membership else {
        return ConversationPermissionSet::empty();
    };
    if !membership.active {
        return ConversationPermissionSet::empty();
    }
    if matches!(kind, crate::ConversationKind::Direct) {
        return basic_member();
    }
    match rank_override {
        Some(set) => set,
        None => rank_default_permissions(membership.role),
    }
}
