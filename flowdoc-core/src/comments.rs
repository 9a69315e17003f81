//! Display-time reconstruction of reply threads.
//!
//! Comments are stored as a flat, append-only list; a thread tree is only
//! built when something needs to render it.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::model::Comment;

/// A comment with its replies, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread<'a> {
    pub comment: &'a Comment,
    pub replies: Vec<CommentThread<'a>>,
}

impl CommentThread<'_> {
    /// Number of comments in this thread including the root.
    pub fn len(&self) -> usize {
        1 + self.replies.iter().map(CommentThread::len).sum::<usize>()
    }
}

/// Build reply threads from a flat comment list.
///
/// Replies to unknown ids (e.g. the parent was never delivered) are promoted
/// to roots so nothing disappears from the view.
pub fn build_threads(comments: &[Comment]) -> Vec<CommentThread<'_>> {
    let known: HashSet<Uuid> = comments.iter().map(|c| c.id).collect();

    let mut children: HashMap<Uuid, Vec<&Comment>> = HashMap::new();
    let mut roots = Vec::new();
    for comment in comments {
        match comment.reply_to {
            Some(parent) if parent != comment.id && known.contains(&parent) => {
                children.entry(parent).or_default().push(comment)
            }
            _ => roots.push(comment),
        }
    }

    fn assemble<'a>(comment: &'a Comment, children: &HashMap<Uuid, Vec<&'a Comment>>) -> CommentThread<'a> {
        let replies = children
            .get(&comment.id)
            .map(|kids| kids.iter().map(|c| assemble(c, children)).collect())
            .unwrap_or_default();
        CommentThread { comment, replies }
    }

    roots.into_iter().map(|c| assemble(c, &children)).collect()
}

/// Comments attached to one step, in arrival order.
pub fn comments_for_step<'a>(comments: &'a [Comment], step_id: &'a str) -> impl Iterator<Item = &'a Comment> {
    comments.iter().filter(move |c| c.step_id.as_deref() == Some(step_id))
}
