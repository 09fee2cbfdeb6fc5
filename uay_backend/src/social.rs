use crate::error::{UayError, UayResult, ValidationError};
use crate::models::{Author, EngagementKind, Lineage, NewPost, Post, UserProfile, POSTS, USERS};
use crate::retry::{guarded_write, Step};
use crate::store::{field, FieldUpdate, Precondition, SharedStore, StoreError, WriteBatch};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementChange {
    Applied,
    /// Membership already matched the requested state.
    Unchanged,
}

/// Follow edges and post engagement. Paired updates always go out in one
/// batch so the two sides of an edge cannot disagree.
#[derive(Clone)]
pub struct SocialGraph {
    store: SharedStore,
    max_write_attempts: usize,
}

impl SocialGraph {
    pub fn new(store: SharedStore, max_write_attempts: usize) -> Self {
        Self {
            store,
            max_write_attempts,
        }
    }

    pub fn follow(&self, viewer_id: &str, target_id: &str) -> UayResult<()> {
        self.write_follow_edge(viewer_id, target_id, true)
    }

    pub fn unfollow(&self, viewer_id: &str, target_id: &str) -> UayResult<()> {
        self.write_follow_edge(viewer_id, target_id, false)
    }

    /// Returns whether the viewer follows the target afterwards.
    pub fn toggle_follow(&self, viewer_id: &str, target_id: &str) -> UayResult<bool> {
        let follow = !self.is_following(viewer_id, target_id)?;
        self.write_follow_edge(viewer_id, target_id, follow)?;
        Ok(follow)
    }

    pub fn is_following(&self, viewer_id: &str, target_id: &str) -> UayResult<bool> {
        let viewer = self
            .store
            .get(USERS, viewer_id)?
            .ok_or_else(|| UayError::user_not_found(viewer_id))?;
        Ok(UserProfile::from_document(&viewer)
            .following
            .contains(target_id))
    }

    fn write_follow_edge(&self, viewer_id: &str, target_id: &str, follow: bool) -> UayResult<()> {
        if viewer_id == target_id {
            return Err(ValidationError::SelfFollow.into());
        }
        let edge = |value: &str| {
            if follow {
                FieldUpdate::ArrayUnion(json!(value))
            } else {
                FieldUpdate::ArrayRemove(json!(value))
            }
        };
        let mut batch = WriteBatch::new();
        batch
            .update(USERS, viewer_id, vec![field("following", edge(target_id))])
            .update(USERS, target_id, vec![field("followers", edge(viewer_id))]);

        match self.store.commit(batch) {
            Ok(()) => {}
            Err(StoreError::NotFound { id, .. }) => return Err(UayError::user_not_found(id)),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(viewer_id, target_id, follow, "follow edge updated");
        Ok(())
    }

    /// Brings `user_id`'s membership in the post's like or repost set to
    /// `desired`, keeping the counter equal to the set size.
    pub fn set_engagement(
        &self,
        kind: EngagementKind,
        post_id: &str,
        user_id: &str,
        desired: bool,
    ) -> UayResult<EngagementChange> {
        let change = guarded_write(
            self.store.as_ref(),
            POSTS,
            post_id,
            self.max_write_attempts,
            |document| {
                let post = Post::from_document(document);
                let mut members = post.engaged_by(kind).clone();
                if members.contains(user_id) == desired {
                    return Ok(Step::Done(EngagementChange::Unchanged));
                }
                let membership = if desired {
                    members.insert(user_id.to_string());
                    FieldUpdate::ArrayUnion(json!(user_id))
                } else {
                    members.remove(user_id);
                    FieldUpdate::ArrayRemove(json!(user_id))
                };
                let mut batch = WriteBatch::new();
                batch.update_if(
                    POSTS,
                    post_id,
                    vec![
                        field(kind.members_field(), membership),
                        field(kind.count_field(), FieldUpdate::Set(json!(members.len()))),
                    ],
                    Precondition::Version(document.version),
                );
                Ok(Step::Write(batch, EngagementChange::Applied))
            },
        )?;
        tracing::debug!(?kind, post_id, user_id, desired, ?change, "engagement");
        Ok(change)
    }

    /// Flips the user's like or repost mark. Returns the new state.
    pub fn toggle_engagement(
        &self,
        kind: EngagementKind,
        post_id: &str,
        user_id: &str,
    ) -> UayResult<bool> {
        let post = self
            .store
            .get(POSTS, post_id)?
            .map(|document| Post::from_document(&document))
            .ok_or_else(|| UayError::post_not_found(post_id))?;
        let desired = !post.engaged_by(kind).contains(user_id);
        self.set_engagement(kind, post_id, user_id, desired)?;
        Ok(desired)
    }

    /// Publishes a new post quoting `post_id` and marks the original as
    /// reposted by the author. Returns the new post's id.
    pub fn repost_with_comment(
        &self,
        author: &Author,
        post_id: &str,
        comment: &str,
    ) -> UayResult<String> {
        let repost_id = guarded_write(
            self.store.as_ref(),
            POSTS,
            post_id,
            self.max_write_attempts,
            |document| {
                let original = Post::from_document(document);
                let mut reposted_by = original.reposted_by.clone();
                reposted_by.insert(author.id.clone());

                let mut batch = WriteBatch::new();
                let repost_id = batch.create(
                    POSTS,
                    NewPost {
                        author: author.clone(),
                        body: comment.trim().to_string(),
                        media_urls: original.media_urls.clone(),
                        lineage: Some(Lineage {
                            original_post_id: original.id.clone(),
                            original_author_id: original.author_id.clone(),
                            original_author_name: original.author_name.clone(),
                            original_body: original.body.clone(),
                        }),
                    }
                    .into_fields(),
                );
                batch.update_if(
                    POSTS,
                    post_id,
                    vec![
                        field("repostedBy", FieldUpdate::ArrayUnion(json!(author.id))),
                        field("repostCount", FieldUpdate::Set(json!(reposted_by.len()))),
                    ],
                    Precondition::Version(document.version),
                );
                Ok(Step::Write(batch, repost_id))
            },
        )?;
        tracing::info!(post_id, repost_id = %repost_id, author_id = %author.id, "reposted");
        Ok(repost_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteDocumentStore;
    use std::sync::Arc;

    fn setup() -> (SharedStore, SocialGraph) {
        let store: SharedStore = Arc::new(SqliteDocumentStore::open_in_memory().unwrap());
        for (id, username) in [("ana", "@ana"), ("bea", "@bea")] {
            let mut batch = WriteBatch::new();
            batch.set(
                USERS,
                id,
                vec![
                    field("username", FieldUpdate::Set(json!(username))),
                    field("following", FieldUpdate::Set(json!([]))),
                    field("followers", FieldUpdate::Set(json!([]))),
                ],
            );
            store.commit(batch).unwrap();
        }
        let graph = SocialGraph::new(store.clone(), 3);
        (store, graph)
    }

    fn profile(store: &SharedStore, id: &str) -> UserProfile {
        UserProfile::from_document(&store.get(USERS, id).unwrap().unwrap())
    }

    fn post(store: &SharedStore, id: &str) -> Post {
        Post::from_document(&store.get(POSTS, id).unwrap().unwrap())
    }

    fn seed_post(store: &SharedStore) -> String {
        store
            .create(
                POSTS,
                NewPost {
                    author: Author {
                        id: "ana".into(),
                        display_name: "@ana".into(),
                        avatar: None,
                    },
                    body: "original".into(),
                    media_urls: vec!["file:///cat.png".into()],
                    lineage: None,
                }
                .into_fields(),
            )
            .unwrap()
    }

    #[test]
    fn follow_then_unfollow_restores_both_sides() {
        let (store, graph) = setup();
        let before = (profile(&store, "ana"), profile(&store, "bea"));

        graph.follow("ana", "bea").unwrap();
        assert!(profile(&store, "ana").following.contains("bea"));
        assert!(profile(&store, "bea").followers.contains("ana"));

        graph.unfollow("ana", "bea").unwrap();
        let after = (profile(&store, "ana"), profile(&store, "bea"));
        assert_eq!(before.0.following, after.0.following);
        assert_eq!(before.1.followers, after.1.followers);
    }

    #[test]
    fn double_follow_is_idempotent() {
        let (store, graph) = setup();
        graph.follow("ana", "bea").unwrap();
        graph.follow("ana", "bea").unwrap();
        assert_eq!(profile(&store, "ana").following.len(), 1);
        assert_eq!(profile(&store, "bea").followers.len(), 1);
        assert!(graph.is_following("ana", "bea").unwrap());
        assert!(!graph.toggle_follow("ana", "bea").unwrap());
        assert!(!graph.is_following("ana", "bea").unwrap());
    }

    #[test]
    fn self_follow_and_missing_target_are_rejected_without_writes() {
        let (store, graph) = setup();
        assert!(matches!(
            graph.follow("ana", "ana"),
            Err(UayError::Validation(ValidationError::SelfFollow))
        ));
        assert!(matches!(
            graph.follow("ana", "ghost"),
            Err(UayError::NotFound { kind: "user", .. })
        ));
        assert!(profile(&store, "ana").following.is_empty());
    }

    #[test]
    fn double_like_counts_once() {
        let (store, graph) = setup();
        let post_id = seed_post(&store);

        let first = graph
            .set_engagement(EngagementKind::Like, &post_id, "bea", true)
            .unwrap();
        let second = graph
            .set_engagement(EngagementKind::Like, &post_id, "bea", true)
            .unwrap();
        assert_eq!(first, EngagementChange::Applied);
        assert_eq!(second, EngagementChange::Unchanged);

        let liked = post(&store, &post_id);
        assert_eq!(liked.like_count, 1);
        assert_eq!(liked.liked_by.len(), 1);

        assert!(!graph
            .toggle_engagement(EngagementKind::Like, &post_id, "bea")
            .unwrap());
        let unliked = post(&store, &post_id);
        assert_eq!(unliked.like_count, 0);
        assert!(unliked.liked_by.is_empty());
    }

    #[test]
    fn repost_carries_lineage_and_marks_original() {
        let (store, graph) = setup();
        let post_id = seed_post(&store);
        let bea = profile(&store, "bea").as_author();

        let repost_id = graph
            .repost_with_comment(&bea, &post_id, "  so true ")
            .unwrap();

        let repost = post(&store, &repost_id);
        let lineage = repost.lineage.clone().expect("lineage");
        assert_eq!(lineage.original_post_id, post_id);
        assert_eq!(lineage.original_author_id, "ana");
        assert_eq!(lineage.original_body, "original");
        assert_eq!(repost.body, "so true");
        assert_eq!(repost.media_urls, vec!["file:///cat.png".to_string()]);
        assert_eq!(repost.like_count, 0);

        let original = post(&store, &post_id);
        assert_eq!(original.repost_count, 1);
        assert!(original.reposted_by.contains("bea"));
    }
}
