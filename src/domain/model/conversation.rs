//! 会话领域模型
//!
//! - DIRECT 会话：恰好两名成员，同一无序成员对唯一
//! - GROUP 会话：创建者始终是成员
//! - `pinned_message_ids` 是消息 `pinned` 标记的派生索引

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "DIRECT",
            ConversationKind::Group => "GROUP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DIRECT" | "SINGLE" => Some(ConversationKind::Direct),
            "GROUP" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// 会话上的用户级标注（与消息状态无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPreference {
    /// 用户在侧边栏置顶该会话
    Pinned,
    /// 用户关闭该会话的通知
    Muted,
    /// 用户手动标记为未读
    ManuallyUnread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub name: Option<String>,
    /// 有序成员集合（插入顺序，去重）
    pub members: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    /// userId -> messageId，仅供 UI 定位，不参与未读计算
    #[serde(default)]
    pub last_read_message_id: HashMap<String, String>,
    #[serde(default)]
    pub pinned_message_ids: Vec<String>,
    #[serde(default)]
    pub manually_marked_unread: BTreeSet<String>,
    #[serde(default)]
    pub pinned_by_users: BTreeSet<String>,
    #[serde(default)]
    pub muted_by_users: BTreeSet<String>,
}

impl Conversation {
    /// 构建 GROUP 会话，保证创建者位于成员列表首位
    pub fn new_group(
        id: String,
        creator_id: &str,
        members: &[String],
        name: Option<String>,
        description: Option<String>,
        avatar_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut ordered = vec![creator_id.to_string()];
        for member in members {
            if !ordered.iter().any(|m| m == member) {
                ordered.push(member.clone());
            }
        }

        Self {
            id,
            kind: ConversationKind::Group,
            name,
            members: ordered,
            created_by: creator_id.to_string(),
            created_at: now,
            updated_at: now,
            description,
            avatar_url,
            last_read_message_id: HashMap::new(),
            pinned_message_ids: Vec::new(),
            manually_marked_unread: BTreeSet::new(),
            pinned_by_users: BTreeSet::new(),
            muted_by_users: BTreeSet::new(),
        }
    }

    /// 构建 DIRECT 会话（调用方负责保证 a != b）
    pub fn new_direct(id: String, user_a: &str, user_b: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            name: None,
            members: vec![user_a.to_string(), user_b.to_string()],
            created_by: user_a.to_string(),
            created_at: now,
            updated_at: now,
            description: None,
            avatar_url: None,
            last_read_message_id: HashMap::new(),
            pinned_message_ids: Vec::new(),
            manually_marked_unread: BTreeSet::new(),
            pinned_by_users: BTreeSet::new(),
            muted_by_users: BTreeSet::new(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    /// 成员集合是否恰好为 {a, b}（无序）
    pub fn has_member_pair(&self, user_a: &str, user_b: &str) -> bool {
        self.members.len() == 2 && self.is_member(user_a) && self.is_member(user_b)
    }

    /// DIRECT 会话中对方的用户ID
    pub fn direct_peer(&self, user_id: &str) -> Option<&str> {
        if !self.is_direct() {
            return None;
        }
        self.members
            .iter()
            .find(|m| m.as_str() != user_id)
            .map(String::as_str)
    }

    pub fn is_pinned_by(&self, user_id: &str) -> bool {
        self.pinned_by_users.contains(user_id)
    }

    pub fn is_muted_by(&self, user_id: &str) -> bool {
        self.muted_by_users.contains(user_id)
    }

    pub fn is_manually_unread(&self, user_id: &str) -> bool {
        self.manually_marked_unread.contains(user_id)
    }

    pub fn preference_set(&self, preference: ConversationPreference) -> &BTreeSet<String> {
        match preference {
            ConversationPreference::Pinned => &self.pinned_by_users,
            ConversationPreference::Muted => &self.muted_by_users,
            ConversationPreference::ManuallyUnread => &self.manually_marked_unread,
        }
    }

    pub fn preference_set_mut(
        &mut self,
        preference: ConversationPreference,
    ) -> &mut BTreeSet<String> {
        match preference {
            ConversationPreference::Pinned => &mut self.pinned_by_users,
            ConversationPreference::Muted => &mut self.muted_by_users,
            ConversationPreference::ManuallyUnread => &mut self.manually_marked_unread,
        }
    }
}

impl Conversation {
    /// 所有成员共享的字段，不含任何用户级标注
    pub fn shared_view(&self) -> ConversationView {
        ConversationView {
            id: self.id.clone(),
            kind: self.kind,
            name: self.name.clone(),
            members: self.members.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            description: self.description.clone(),
            avatar_url: self.avatar_url.clone(),
            pinned_message_ids: self.pinned_message_ids.clone(),
            viewer: None,
        }
    }

    /// 指定用户看到的会话：共享字段 + 该用户自己的标注
    pub fn view_for(&self, user_id: &str) -> ConversationView {
        let mut view = self.shared_view();
        view.viewer = Some(ViewerState {
            user_id: user_id.to_string(),
            pinned: self.is_pinned_by(user_id),
            muted: self.is_muted_by(user_id),
            manually_unread: self.is_manually_unread(user_id),
            last_read_message_id: self.last_read_message_id.get(user_id).cloned(),
        });
        view
    }
}

/// 对外返回与推送的会话表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: String,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub members: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub pinned_message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ViewerState>,
}

impl ConversationView {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    pub fn has_member_pair(&self, user_a: &str, user_b: &str) -> bool {
        self.members.len() == 2 && self.is_member(user_a) && self.is_member(user_b)
    }
}

/// 请求者自己的会话标注
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerState {
    pub user_id: String,
    pub pinned: bool,
    pub muted: bool,
    pub manually_unread: bool,
    pub last_read_message_id: Option<String>,
}

/// 群资料更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetaUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

impl ConversationMetaUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.avatar_url.is_none()
    }

    pub fn apply(&self, conversation: &mut Conversation) {
        if let Some(name) = &self.name {
            conversation.name = Some(name.clone());
        }
        if let Some(description) = &self.description {
            conversation.description = Some(description.clone());
        }
        if let Some(avatar_url) = &self.avatar_url {
            conversation.avatar_url = Some(avatar_url.clone());
        }
    }
}
