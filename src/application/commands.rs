use crate::domain::model::{ConversationKind, ConversationMetaUpdate, MessageKind};

/// 创建会话命令
#[derive(Debug, Clone)]
pub struct CreateConversationCommand {
    pub actor_id: String,
    pub kind: ConversationKind,
    pub members: Vec<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

/// 成员变更命令（添加 / 移除共用）
#[derive(Debug, Clone)]
pub struct MemberCommand {
    pub conversation_id: String,
    pub user_id: String,
    pub actor_id: String,
}

/// 删除群会话命令
#[derive(Debug, Clone)]
pub struct DeleteConversationCommand {
    pub conversation_id: String,
    pub actor_id: String,
}

/// 更新群资料命令
#[derive(Debug, Clone)]
pub struct UpdateGroupInfoCommand {
    pub conversation_id: String,
    pub actor_id: String,
    pub update: ConversationMetaUpdate,
}

/// 会话级用户标注
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceChange {
    Pinned(bool),
    Muted(bool),
    MarkUnread,
}

/// 更新会话标注命令
#[derive(Debug, Clone)]
pub struct UpdatePreferenceCommand {
    pub conversation_id: String,
    pub user_id: String,
    pub change: PreferenceChange,
}

/// 发送消息命令
#[derive(Debug, Clone)]
pub struct SendMessageCommand {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
}

/// 按对端发送单聊消息命令
#[derive(Debug, Clone)]
pub struct SendDirectCommand {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub kind: MessageKind,
}

/// 编辑消息命令
#[derive(Debug, Clone)]
pub struct EditMessageCommand {
    pub message_id: String,
    pub editor_id: String,
    pub content: String,
}

/// 单条消息上的操作命令（撤回、仅自己删除、取消回应）
#[derive(Debug, Clone)]
pub struct MessageActionCommand {
    pub message_id: String,
    pub actor_id: String,
}

/// 置顶 / 取消置顶命令
#[derive(Debug, Clone)]
pub struct PinMessageCommand {
    pub conversation_id: String,
    pub message_id: String,
    pub actor_id: String,
    pub pinned: bool,
}

/// 添加回应命令
#[derive(Debug, Clone)]
pub struct AddReactionCommand {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

/// 标记已读命令
#[derive(Debug, Clone)]
pub struct MarkReadCommand {
    pub conversation_id: String,
    pub user_id: String,
    /// UI 定位指针，不参与未读计算
    pub last_message_id: Option<String>,
}

/// 正在输入命令
#[derive(Debug, Clone)]
pub struct TypingCommand {
    pub conversation_id: String,
    pub user_id: String,
    pub typing: bool,
}
