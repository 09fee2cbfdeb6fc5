use crate::error::{UayError, UayResult, ValidationError};
use crate::models::{Author, Comment, Post, POSTS};
use crate::retry::{guarded_write, Step};
use crate::store::{field, FieldUpdate, Precondition, SharedStore, StoreError, WriteBatch};
use serde_json::Value;

/// A post's comments in display order, replies nested under their parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentTree {
    comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub tree: CommentTree,
    /// False when the parent was not found; `tree` then equals the input.
    pub attached: bool,
}

impl CommentTree {
    pub fn new(comments: Vec<Comment>) -> Self {
        Self { comments }
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn into_comments(self) -> Vec<Comment> {
        self.comments
    }

    /// Returns a copy of the tree with `comment` appended to the children of
    /// `parent_id`, or to the top level when no parent is given.
    pub fn insert_reply(&self, parent_id: Option<&str>, comment: Comment) -> InsertOutcome {
        let mut comments = self.comments.clone();
        let attached = match parent_id {
            None => {
                comments.push(comment);
                true
            }
            Some(parent_id) => attach(&mut comments, parent_id, &comment),
        };
        InsertOutcome {
            tree: CommentTree { comments },
            attached,
        }
    }

    pub fn find(&self, comment_id: &str) -> Option<&Comment> {
        find_in(&self.comments, comment_id)
    }

    pub fn contains(&self, comment_id: &str) -> bool {
        self.find(comment_id).is_some()
    }

    /// Comments at every depth.
    pub fn total_len(&self) -> usize {
        fn count(nodes: &[Comment]) -> usize {
            nodes
                .iter()
                .map(|node| 1 + count(&node.sub_comments))
                .sum()
        }
        count(&self.comments)
    }
}

/// Depth-first over the whole tree. Ids are only practically unique, so
/// every node carrying `parent_id` gets the reply; matched nodes are not
/// searched further.
fn attach(nodes: &mut [Comment], parent_id: &str, comment: &Comment) -> bool {
    let mut attached = false;
    for node in nodes.iter_mut() {
        if node.comment_id == parent_id {
            node.sub_comments.push(comment.clone());
            attached = true;
        } else {
            attached |= attach(&mut node.sub_comments, parent_id, comment);
        }
    }
    attached
}

/// The walk of [`attach`] over stored JSON. Nodes the model cannot read are
/// carried through untouched; a matched node with a missing or malformed
/// `subComments` gets a fresh list.
fn attach_stored(nodes: &mut [Value], parent_id: &str, reply: &Value) -> bool {
    let mut attached = false;
    for node in nodes.iter_mut() {
        let Some(object) = node.as_object_mut() else {
            continue;
        };
        if object.get("commentId").and_then(Value::as_str) == Some(parent_id) {
            match object.get_mut("subComments") {
                Some(Value::Array(children)) => children.push(reply.clone()),
                _ => {
                    object.insert("subComments".into(), Value::Array(vec![reply.clone()]));
                }
            }
            attached = true;
        } else if let Some(Value::Array(children)) = object.get_mut("subComments") {
            attached |= attach_stored(children, parent_id, reply);
        }
    }
    attached
}

fn stored_contains(nodes: &[Value], comment_id: &str) -> bool {
    nodes.iter().any(|node| {
        node.get("commentId").and_then(Value::as_str) == Some(comment_id)
            || matches!(
                node.get("subComments"),
                Some(Value::Array(children)) if stored_contains(children, comment_id)
            )
    })
}

fn find_in<'a>(nodes: &'a [Comment], comment_id: &str) -> Option<&'a Comment> {
    nodes.iter().find_map(|node| {
        if node.comment_id == comment_id {
            Some(node)
        } else {
            find_in(&node.sub_comments, comment_id)
        }
    })
}

#[derive(Clone)]
pub struct CommentService {
    store: SharedStore,
    max_write_attempts: usize,
}

impl CommentService {
    pub fn new(store: SharedStore, max_write_attempts: usize) -> Self {
        Self {
            store,
            max_write_attempts,
        }
    }

    pub fn comments_for(&self, post_id: &str) -> UayResult<CommentTree> {
        let document = self
            .store
            .get(POSTS, post_id)?
            .ok_or_else(|| UayError::post_not_found(post_id))?;
        Ok(CommentTree::new(Post::from_document(&document).comments))
    }

    /// Adds a top-level comment or a reply. The stored tree is edited as JSON,
    /// so comments from older clients survive the write-back unchanged, and it
    /// is written back only if the post did not change since it was read.
    pub fn add_comment(
        &self,
        post_id: &str,
        parent_id: Option<&str>,
        author: &Author,
        body: &str,
    ) -> UayResult<Comment> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ValidationError::EmptyComment.into());
        }
        let comment = Comment::new(author, body);
        let reply = serde_json::to_value(&comment).map_err(StoreError::from)?;

        guarded_write(
            self.store.as_ref(),
            POSTS,
            post_id,
            self.max_write_attempts,
            |document| {
                let mut stored = match document.field("comments") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                if stored_contains(&stored, &comment.comment_id) {
                    // An earlier attempt landed even though its commit reported a conflict.
                    return Ok(Step::Done(()));
                }
                let attached = match parent_id {
                    None => {
                        stored.push(reply.clone());
                        true
                    }
                    Some(parent_id) => attach_stored(&mut stored, parent_id, &reply),
                };
                if !attached {
                    return Err(UayError::CommentNotFound {
                        post_id: post_id.to_string(),
                        parent_id: parent_id.unwrap_or_default().to_string(),
                    });
                }
                let mut batch = WriteBatch::new();
                batch.update_if(
                    POSTS,
                    post_id,
                    vec![field("comments", FieldUpdate::Set(Value::Array(stored)))],
                    Precondition::Version(document.version),
                );
                Ok(Step::Write(batch, ()))
            },
        )?;

        tracing::info!(
            post_id,
            comment_id = %comment.comment_id,
            parent_id = parent_id.unwrap_or("-"),
            "comment added"
        );
        Ok(comment)
    }
}
