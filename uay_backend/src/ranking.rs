//! Time-decayed feed weighting.

use crate::models::Post;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeSet;

pub const LIKE_WEIGHT: f64 = 2.0;
pub const REPOST_WEIGHT: f64 = 1.5;
pub const FOLLOWED_AUTHOR_BONUS: f64 = 5.0;
pub const DECAY_PER_HOUR: f64 = 0.1;

/// Engagement score minus age decay. Posts without a server timestamp yet
/// are treated as created at `now`.
pub fn weight(post: &Post, following: &BTreeSet<String>, now: DateTime<Utc>) -> f64 {
    let created_at = post.created_at.unwrap_or(now);
    let age_hours = (now - created_at).num_milliseconds().abs() as f64 / 3_600_000.0;
    let follow_bonus = if following.contains(&post.author_id) {
        FOLLOWED_AUTHOR_BONUS
    } else {
        0.0
    };
    post.like_count as f64 * LIKE_WEIGHT + post.repost_count as f64 * REPOST_WEIGHT + follow_bonus
        - age_hours * DECAY_PER_HOUR
}

/// Newest first, ties broken by id descending. Pending timestamps sort ahead
/// of everything.
pub fn newest_first(a: &Post, b: &Post) -> Ordering {
    match (a.created_at, b.created_at) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (left, right) => right.cmp(&left).then_with(|| b.id.cmp(&a.id)),
    }
}

pub fn sort_newest_first(posts: &mut [Post]) {
    posts.sort_by(newest_first);
}

/// Reorders by weight descending; equal weights stay newest first.
pub fn rank_by_weight(posts: &mut [Post], following: &BTreeSet<String>, now: DateTime<Utc>) {
    sort_newest_first(posts);
    posts.sort_by(|a, b| weight(b, following, now).total_cmp(&weight(a, following, now)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Post;
    use chrono::Duration;

    fn post(
        id: &str,
        author: &str,
        likes: u64,
        reposts: u64,
        created_at: Option<DateTime<Utc>>,
    ) -> Post {
        Post {
            id: id.into(),
            version: 1,
            author_id: author.into(),
            author_name: String::new(),
            author_avatar: None,
            body: String::new(),
            media_urls: Vec::new(),
            created_at,
            like_count: likes,
            liked_by: BTreeSet::new(),
            repost_count: reposts,
            reposted_by: BTreeSet::new(),
            comments: Vec::new(),
            lineage: None,
        }
    }

    #[test]
    fn weight_combines_engagement_follow_bonus_and_decay() {
        let now = Utc::now();
        let following: BTreeSet<String> = ["alice".to_string()].into();
        let candidate = post("p1", "alice", 10, 4, Some(now - Duration::hours(2)));
        let score = weight(&candidate, &following, now);
        assert!((score - 30.8).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn pending_timestamp_has_no_decay() {
        let now = Utc::now();
        let pending = post("p1", "bob", 1, 0, None);
        assert!((weight(&pending, &BTreeSet::new(), now) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn weight_decreases_with_age() {
        let now = Utc::now();
        let following = BTreeSet::new();
        let mut previous = f64::INFINITY;
        for hours in [0, 1, 5, 24, 240] {
            let candidate = post("p", "bob", 3, 1, Some(now - Duration::hours(hours)));
            let score = weight(&candidate, &following, now);
            assert!(score < previous);
            previous = score;
        }
    }

    #[test]
    fn chronological_order_puts_pending_first_and_breaks_ties_by_id() {
        let now = Utc::now();
        let mut posts = vec![
            post("a", "x", 0, 0, Some(now)),
            post("c", "x", 0, 0, Some(now - Duration::minutes(1))),
            post("b", "x", 0, 0, Some(now)),
            post("z", "x", 0, 0, None),
        ];
        sort_newest_first(&mut posts);
        let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "b", "a", "c"]);
    }

    #[test]
    fn ranking_keeps_newest_first_among_equal_weights() {
        let now = Utc::now();
        let mut posts = vec![
            post("old", "x", 0, 0, Some(now)),
            post("popular", "x", 5, 0, Some(now - Duration::hours(1))),
            post("new", "x", 0, 0, Some(now)),
        ];
        rank_by_weight(&mut posts, &BTreeSet::new(), now);
        let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["popular", "old", "new"]);
    }
}
