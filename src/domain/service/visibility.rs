//! 可见性解析器
//!
//! 决定某个用户能看到什么。两种模式的撤回处理刻意不同：
//! - `History`：对自己删除的消息隐藏；撤回消息保留位置，内容替换为占位文本
//! - `Preview`：侧边栏“最新消息”跳过撤回消息，取最近一条未撤回且未删除的消息；
//!   只有不存在这样的消息时才返回撤回占位

use crate::domain::model::{Message, MessageView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityMode {
    History,
    Preview,
}

/// 单条消息的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    /// 对该用户不可见
    Hidden,
    /// 预览模式下被跳过，但可作为最终占位的候选
    Skipped,
    Visible(MessageView),
}

impl Visibility {
    pub fn into_view(self) -> Option<MessageView> {
        match self {
            Visibility::Visible(view) => Some(view),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VisibilityResolver;

impl VisibilityResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn visible(&self, message: &Message, user_id: &str, mode: VisibilityMode) -> Visibility {
        if message.is_deleted_for(user_id) {
            return Visibility::Hidden;
        }

        match (mode, message.recalled) {
            (_, false) => Visibility::Visible(MessageView::plain(message)),
            (VisibilityMode::History, true) => {
                Visibility::Visible(MessageView::recalled_placeholder(message))
            }
            (VisibilityMode::Preview, true) => Visibility::Skipped,
        }
    }

    /// 历史模式批量渲染，保持输入顺序
    pub fn history<'a, I>(&self, messages: I, user_id: &str) -> Vec<MessageView>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        messages
            .into_iter()
            .filter_map(|m| self.visible(m, user_id, VisibilityMode::History).into_view())
            .collect()
    }

    /// 从按时间倒序排列的候选中选出最新预览
    pub fn preview<'a, I>(&self, newest_first: I, user_id: &str) -> Option<MessageView>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut recalled_fallback: Option<&Message> = None;

        for message in newest_first {
            match self.visible(message, user_id, VisibilityMode::Preview) {
                Visibility::Visible(view) => return Some(view),
                Visibility::Skipped => {
                    if recalled_fallback.is_none() {
                        recalled_fallback = Some(message);
                    }
                }
                Visibility::Hidden => {}
            }
        }

        recalled_fallback.map(MessageView::recalled_placeholder)
    }
}
