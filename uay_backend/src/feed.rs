//! Live, paginated feed assembled from one or more store listeners.
//!
//! A feed is a list of cursor-bounded segments. The newest segment has no
//! upper bound, so posts created while the user is paging land there and
//! never push older items across a page boundary. Only the oldest segment
//! (the tail) carries a page limit; `fetch_more` pins it at its last item and
//! opens a new tail strictly after that item.
//!
//! Every segment holds one listener per author partition. Following-only
//! feeds split the following set into chunks that fit the store's
//! membership filter; other modes use a single partition.

use crate::config::FeedConfig;
use crate::error::UayResult;
use crate::models::{Post, UserProfile, POSTS, USERS};
use crate::ranking::{rank_by_weight, sort_newest_first};
use crate::store::{
    Cursor, DocumentStore, Filter, ListenEvent, ListenSink, ListenerId, Query, SharedStore,
    MAX_IN_VALUES,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMode {
    Global,
    FollowingOnly,
    ByAuthor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedOrder {
    #[default]
    Newest,
    Weighted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedParams {
    pub viewer_id: String,
    pub mode: FeedMode,
    pub order: FeedOrder,
}

impl FeedParams {
    pub fn new(viewer_id: impl Into<String>, mode: FeedMode) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            mode,
            order: FeedOrder::Newest,
        }
    }

    pub fn weighted(mut self) -> Self {
        self.order = FeedOrder::Weighted;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmptyState {
    LoadingFollowing,
    FollowingNobody,
    NoPostsFromFollowing,
    NoPosts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub posts: Vec<Post>,
    pub has_more: bool,
    pub empty_state: Option<EmptyState>,
    /// Last listener failure. `posts` still holds the last good data.
    pub error: Option<String>,
}

pub fn classify_empty(
    mode: &FeedMode,
    following: Option<&BTreeSet<String>>,
    has_posts: bool,
) -> Option<EmptyState> {
    if has_posts {
        return None;
    }
    Some(match (mode, following) {
        (FeedMode::FollowingOnly, None) => EmptyState::LoadingFollowing,
        (FeedMode::FollowingOnly, Some(set)) if set.is_empty() => EmptyState::FollowingNobody,
        (FeedMode::FollowingOnly, Some(_)) => EmptyState::NoPostsFromFollowing,
        _ => EmptyState::NoPosts,
    })
}

/// Splits authors into groups of at most `size`, in sorted order.
pub fn partition_authors(authors: &BTreeSet<String>, size: usize) -> Vec<Vec<String>> {
    let size = size.clamp(1, MAX_IN_VALUES);
    let authors: Vec<String> = authors.iter().cloned().collect();
    authors.chunks(size).map(<[String]>::to_vec).collect()
}

fn partition_filters(
    mode: &FeedMode,
    following: &BTreeSet<String>,
    partition_size: usize,
) -> Vec<Option<Filter>> {
    match mode {
        FeedMode::Global => vec![None],
        FeedMode::ByAuthor(author_id) => {
            vec![Some(Filter::Eq("authorId".into(), json!(author_id)))]
        }
        FeedMode::FollowingOnly => partition_authors(following, partition_size)
            .into_iter()
            .map(|group| {
                Some(Filter::In(
                    "authorId".into(),
                    group.into_iter().map(Value::String).collect(),
                ))
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
struct Bounds {
    start_after: Option<Cursor>,
    end_at: Option<Cursor>,
    /// Open segments are page limited and may grow into the next page.
    open: bool,
}

struct PartitionListener {
    id: ListenerId,
    tag: u64,
    /// `None` until the first snapshot arrives.
    posts: Option<Vec<Post>>,
}

struct Segment {
    bounds: Bounds,
    partitions: Vec<PartitionListener>,
}

impl Segment {
    fn is_loaded(&self) -> bool {
        self.partitions.iter().all(|partition| partition.posts.is_some())
    }

    /// Union of the partitions, newest first, without duplicates.
    fn union(&self) -> Vec<Post> {
        let mut seen = HashSet::new();
        let mut posts: Vec<Post> = self
            .partitions
            .iter()
            .filter_map(|partition| partition.posts.as_ref())
            .flatten()
            .filter(|post| seen.insert(post.id.clone()))
            .cloned()
            .collect();
        sort_newest_first(&mut posts);
        posts
    }

    fn visible(&self, page_size: usize) -> Vec<Post> {
        let mut posts = self.union();
        if self.bounds.open {
            posts.truncate(page_size);
        }
        posts
    }
}

struct Session {
    generation: u64,
    params: FeedParams,
    following: Option<BTreeSet<String>>,
    filters: Vec<Option<Filter>>,
    segments: Vec<Segment>,
    routes: HashMap<u64, (usize, usize)>,
    next_tag: u64,
    tx: UnboundedSender<ListenEvent>,
    rx: UnboundedReceiver<ListenEvent>,
    error: Option<String>,
}

impl Session {
    fn tag(&mut self) -> u64 {
        self.next_tag += 1;
        (self.generation << 32) | self.next_tag
    }

    fn register(
        &mut self,
        store: &dyn DocumentStore,
        bounds: &Bounds,
        page_size: usize,
    ) -> UayResult<Vec<PartitionListener>> {
        let mut listeners = Vec::with_capacity(self.filters.len());
        for filter in self.filters.clone() {
            let mut query = Query::collection(POSTS).order_by_desc("createdAt");
            if let Some(filter) = filter {
                query = query.filter(filter);
            }
            if let Some(cursor) = &bounds.start_after {
                query = query.start_after(cursor.clone());
            }
            if let Some(cursor) = &bounds.end_at {
                query = query.end_at(cursor.clone());
            }
            if bounds.open {
                query = query.limit(page_size);
            }
            let tag = self.tag();
            match store.listen(query, ListenSink::new(tag, self.tx.clone())) {
                Ok(id) => listeners.push(PartitionListener {
                    id,
                    tag,
                    posts: None,
                }),
                Err(err) => {
                    for listener in &listeners {
                        store.unlisten(listener.id);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(listeners)
    }

    fn route(&mut self, index: usize) {
        for (partition, listener) in self.segments[index].partitions.iter().enumerate() {
            self.routes.insert(listener.tag, (index, partition));
        }
    }

    fn release(&mut self, store: &dyn DocumentStore, partitions: &[PartitionListener]) {
        for listener in partitions {
            store.unlisten(listener.id);
            self.routes.remove(&listener.tag);
        }
    }

    fn push_segment(
        &mut self,
        store: &dyn DocumentStore,
        bounds: Bounds,
        page_size: usize,
    ) -> UayResult<()> {
        let partitions = self.register(store, &bounds, page_size)?;
        self.segments.push(Segment { bounds, partitions });
        self.route(self.segments.len() - 1);
        Ok(())
    }

    /// Swaps a segment's listeners for new ones over `bounds`. The new
    /// listeners are attached before the old ones are dropped.
    fn replace_segment(
        &mut self,
        store: &dyn DocumentStore,
        index: usize,
        bounds: Bounds,
        page_size: usize,
    ) -> UayResult<()> {
        let partitions = self.register(store, &bounds, page_size)?;
        let previous = std::mem::replace(
            &mut self.segments[index],
            Segment { bounds, partitions },
        );
        self.release(store, &previous.partitions);
        self.route(index);
        Ok(())
    }

    fn release_all(&mut self, store: &dyn DocumentStore) {
        let segments = std::mem::take(&mut self.segments);
        for segment in &segments {
            self.release(store, &segment.partitions);
        }
    }

    /// Returns false for events from listeners that are no longer routed.
    fn apply(&mut self, event: ListenEvent) -> bool {
        let tag = event.tag();
        if tag >> 32 != self.generation {
            return false;
        }
        let Some(&(segment, partition)) = self.routes.get(&tag) else {
            return false;
        };
        match event {
            ListenEvent::Snapshot { documents, .. } => {
                let posts = documents.iter().map(Post::from_document).collect();
                self.segments[segment].partitions[partition].posts = Some(posts);
                self.error = None;
            }
            ListenEvent::Error { message, .. } => {
                tracing::warn!(
                    generation = self.generation,
                    segment,
                    partition,
                    error = %message,
                    "feed listener failed; keeping last snapshot"
                );
                self.error = Some(message);
            }
        }
        true
    }

    fn drain(&mut self) -> bool {
        let mut applied = false;
        loop {
            match self.rx.try_recv() {
                Ok(event) => applied |= self.apply(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    fn tail(&self) -> Option<&Segment> {
        self.segments.last()
    }

    fn has_more(&self, page_size: usize) -> bool {
        self.tail()
            .map(|tail| tail.bounds.open && tail.union().len() >= page_size)
            .unwrap_or(false)
    }

    fn snapshot(&self, page_size: usize) -> FeedSnapshot {
        let mut seen = HashSet::new();
        let mut posts: Vec<Post> = self
            .segments
            .iter()
            .flat_map(|segment| segment.visible(page_size))
            .filter(|post| seen.insert(post.id.clone()))
            .collect();
        sort_newest_first(&mut posts);
        if self.params.order == FeedOrder::Weighted {
            let empty = BTreeSet::new();
            let following = self.following.as_ref().unwrap_or(&empty);
            rank_by_weight(&mut posts, following, Utc::now());
        }
        FeedSnapshot {
            has_more: self.has_more(page_size),
            empty_state: classify_empty(
                &self.params.mode,
                self.following.as_ref(),
                !posts.is_empty(),
            ),
            error: self.error.clone(),
            posts,
        }
    }
}

pub struct FeedEngine {
    store: SharedStore,
    config: FeedConfig,
    generation: u64,
    session: Option<Session>,
}

impl FeedEngine {
    pub fn new(store: SharedStore, config: FeedConfig) -> Self {
        Self {
            store,
            config,
            generation: 0,
            session: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn params(&self) -> Option<&FeedParams> {
        self.session.as_ref().map(|session| &session.params)
    }

    /// Opens the first page. Any running feed is stopped first.
    pub fn start(&mut self, params: FeedParams) -> UayResult<FeedSnapshot> {
        self.stop();
        self.generation += 1;
        let following = self.load_following(&params.viewer_id)?;
        let filters = partition_filters(&params.mode, &following, self.config.partition_size);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = Session {
            generation: self.generation,
            params,
            following: Some(following),
            filters,
            segments: Vec::new(),
            routes: HashMap::new(),
            next_tag: 0,
            tx,
            rx,
            error: None,
        };
        session.push_segment(
            self.store.as_ref(),
            Bounds {
                start_after: None,
                end_at: None,
                open: true,
            },
            self.config.page_size,
        )?;
        session.drain();
        tracing::info!(
            generation = session.generation,
            viewer_id = %session.params.viewer_id,
            mode = ?session.params.mode,
            partitions = session.filters.len(),
            "feed started"
        );
        self.session = Some(session);
        Ok(self.snapshot())
    }

    /// Unregisters every listener and drops the event channel.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release_all(self.store.as_ref());
            tracing::debug!(generation = session.generation, "feed stopped");
        }
    }

    pub fn restart(&mut self, params: FeedParams) -> UayResult<FeedSnapshot> {
        self.stop();
        self.start(params)
    }

    /// Loads the page after the current tail. Returns false when there was
    /// nothing more to load.
    pub fn fetch_more(&mut self) -> UayResult<bool> {
        let page_size = self.config.page_size;
        let store = self.store.as_ref();
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        session.drain();
        if !session.has_more(page_size) {
            return Ok(false);
        }
        let tail_index = session.segments.len() - 1;
        let tail = &session.segments[tail_index];
        if !tail.is_loaded() {
            return Ok(false);
        }
        let Some(boundary) = tail.visible(page_size).last().and_then(Post::cursor) else {
            return Ok(false);
        };
        let pinned = Bounds {
            start_after: tail.bounds.start_after.clone(),
            end_at: Some(boundary.clone()),
            open: false,
        };

        session.replace_segment(store, tail_index, pinned, page_size)?;
        session.push_segment(
            store,
            Bounds {
                start_after: Some(boundary.clone()),
                end_at: None,
                open: true,
            },
            page_size,
        )?;
        session.drain();
        tracing::debug!(
            generation = session.generation,
            segments = session.segments.len(),
            boundary = ?boundary,
            "feed page requested"
        );
        Ok(true)
    }

    /// Re-reads the viewer's following set. A following-only feed is
    /// re-partitioned when the set changed. Returns whether it changed.
    pub fn refresh_following(&mut self) -> UayResult<bool> {
        let Some(viewer_id) = self.params().map(|params| params.viewer_id.clone()) else {
            return Ok(false);
        };
        let following = self.load_following(&viewer_id)?;
        let page_size = self.config.page_size;
        let partition_size = self.config.partition_size;
        let store = self.store.as_ref();
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        if session.following.as_ref() == Some(&following) {
            return Ok(false);
        }

        if session.params.mode == FeedMode::FollowingOnly {
            session.filters = partition_filters(&session.params.mode, &following, partition_size);
            for index in 0..session.segments.len() {
                let bounds = session.segments[index].bounds.clone();
                session.replace_segment(store, index, bounds, page_size)?;
            }
        }
        tracing::info!(
            generation = session.generation,
            following = following.len(),
            "following set changed"
        );
        session.following = Some(following);
        session.drain();
        Ok(true)
    }

    /// Current merged view, without waiting for new events.
    pub fn snapshot(&self) -> FeedSnapshot {
        match &self.session {
            Some(session) => session.snapshot(self.config.page_size),
            None => FeedSnapshot::default(),
        }
    }

    /// Applies queued store events and returns a fresh snapshot if any of
    /// them belonged to this feed.
    pub fn poll_update(&mut self) -> Option<FeedSnapshot> {
        let applied = self.session.as_mut()?.drain();
        applied.then(|| self.snapshot())
    }

    /// Waits for the next relevant store event. Returns `None` once the
    /// feed is stopped.
    pub async fn next_update(&mut self) -> Option<FeedSnapshot> {
        loop {
            let session = self.session.as_mut()?;
            let event = session.rx.recv().await?;
            let mut applied = session.apply(event);
            applied |= session.drain();
            if applied {
                return Some(self.snapshot());
            }
        }
    }

    fn load_following(&self, viewer_id: &str) -> UayResult<BTreeSet<String>> {
        if viewer_id.is_empty() {
            return Ok(BTreeSet::new());
        }
        match self.store.get(USERS, viewer_id)? {
            Some(document) => Ok(UserProfile::from_document(&document).following),
            None => {
                tracing::debug!(viewer_id, "viewer has no profile; following nobody");
                Ok(BTreeSet::new())
            }
        }
    }
}

impl Drop for FeedEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Author, NewPost};
    use crate::social::SocialGraph;
    use crate::store::{
        field, Document, FieldUpdate, SqliteDocumentStore, StoreError, StoreResult, WriteBatch,
    };
    use std::sync::{Arc, Mutex};

    fn config(page_size: usize) -> FeedConfig {
        FeedConfig {
            page_size,
            ..FeedConfig::default()
        }
    }

    fn add_user(store: &dyn DocumentStore, id: &str, following: &[&str]) {
        let mut batch = WriteBatch::new();
        batch.set(
            USERS,
            id,
            vec![
                field("username", FieldUpdate::Set(json!(format!("@{id}")))),
                field("following", FieldUpdate::Set(json!(following))),
                field("followers", FieldUpdate::Set(json!([]))),
            ],
        );
        store.commit(batch).unwrap();
    }

    fn add_post(store: &dyn DocumentStore, author: &str, body: &str) -> String {
        store
            .create(
                POSTS,
                NewPost {
                    author: Author {
                        id: author.into(),
                        display_name: format!("@{author}"),
                        avatar: None,
                    },
                    body: body.into(),
                    media_urls: Vec::new(),
                    lineage: None,
                }
                .into_fields(),
            )
            .unwrap()
    }

    fn ids(snapshot: &FeedSnapshot) -> Vec<String> {
        snapshot.posts.iter().map(|post| post.id.clone()).collect()
    }

    fn assert_strictly_newest_first(snapshot: &FeedSnapshot) {
        for pair in snapshot.posts.windows(2) {
            assert_eq!(
                crate::ranking::newest_first(&pair[0], &pair[1]),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn fifteen_posts_page_as_ten_then_five() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        let all: Vec<String> = (0..15)
            .map(|i| add_post(&sqlite, "ana", &format!("post {i}")))
            .collect();
        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(10));

        let first = engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();
        assert_eq!(first.posts.len(), 10);
        assert!(first.has_more);
        assert_strictly_newest_first(&first);

        assert!(engine.fetch_more().unwrap());
        let second = engine.snapshot();
        assert_eq!(second.posts.len(), 15);
        assert!(!second.has_more);
        assert_strictly_newest_first(&second);

        let mut expected = all.clone();
        expected.reverse();
        assert_eq!(ids(&second), expected);
        assert!(!engine.fetch_more().unwrap());
    }

    #[test]
    fn posts_arriving_between_pages_cause_no_skips_or_repeats() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        for i in 0..15 {
            add_post(&sqlite, "ana", &format!("post {i}"));
        }
        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(10));
        engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();

        let fresh = add_post(&sqlite, "ana", "breaking");
        let update = engine.poll_update().expect("live update");
        assert_eq!(update.posts.len(), 10);
        assert_eq!(update.posts[0].id, fresh);

        assert!(engine.fetch_more().unwrap());
        let merged = engine.snapshot();
        assert_eq!(merged.posts.len(), 16);
        let unique: HashSet<_> = ids(&merged).into_iter().collect();
        assert_eq!(unique.len(), 16);
        assert_strictly_newest_first(&merged);

        // The first page is pinned now; newer posts grow it instead of
        // shifting items into the second page.
        let tail_before: Vec<String> = ids(&merged)[10..].to_vec();
        let later = add_post(&sqlite, "ana", "later");
        let grown = engine.poll_update().expect("live update");
        assert_eq!(grown.posts.len(), 17);
        assert_eq!(grown.posts[0].id, later);
        assert_eq!(ids(&grown)[11..].to_vec(), tail_before);
    }

    #[test]
    fn text_dated_posts_do_not_disturb_paging() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.set(
            POSTS,
            "legacy",
            vec![
                field("authorId", FieldUpdate::Set(json!("ana"))),
                field("body", FieldUpdate::Set(json!("from 2020"))),
                field("createdAt", FieldUpdate::Set(json!("2020-01-01T00:00:00Z"))),
            ],
        );
        sqlite.commit(batch).unwrap();
        let newer: Vec<String> = (0..3)
            .map(|i| add_post(&sqlite, "ana", &format!("post {i}")))
            .collect();
        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(1));

        let first = engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();
        assert_eq!(ids(&first), vec![newer[2].clone()]);

        assert!(engine.fetch_more().unwrap());
        let second = engine.snapshot();
        assert_eq!(ids(&second), vec![newer[2].clone(), newer[1].clone()]);
        assert_strictly_newest_first(&second);
    }

    #[test]
    fn following_set_is_partitioned_in_tens() {
        let authors: BTreeSet<String> = (0..23).map(|i| format!("user-{i:02}")).collect();
        let groups = partition_authors(&authors, 10);
        let sizes: Vec<_> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        let union: BTreeSet<String> = groups.into_iter().flatten().collect();
        assert_eq!(union, authors);
    }

    #[test]
    fn following_only_feed_unions_every_partition() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        let followees: Vec<String> = (0..23).map(|i| format!("user-{i:02}")).collect();
        let refs: Vec<&str> = followees.iter().map(String::as_str).collect();
        add_user(&sqlite, "viewer", &refs);
        for followee in &followees {
            add_post(&sqlite, followee, "hi");
        }
        add_post(&sqlite, "stranger", "not for you");

        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(30));
        let snapshot = engine
            .start(FeedParams::new("viewer", FeedMode::FollowingOnly))
            .unwrap();
        assert_eq!(sqlite.listener_count(), 3);
        assert_eq!(snapshot.posts.len(), 23);
        assert!(snapshot.posts.iter().all(|post| post.author_id != "stranger"));
        assert_strictly_newest_first(&snapshot);

        let mut small = FeedEngine::new(Arc::new(sqlite.clone()), config(10));
        let mut page = small
            .start(FeedParams::new("viewer", FeedMode::FollowingOnly))
            .unwrap();
        assert_eq!(page.posts.len(), 10);
        while small.fetch_more().unwrap() {
            page = small.snapshot();
        }
        assert_eq!(page.posts.len(), 23);
        let unique: HashSet<_> = ids(&page).into_iter().collect();
        assert_eq!(unique.len(), 23);
    }

    #[test]
    fn empty_states_describe_why_nothing_shows() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        add_user(&sqlite, "loner", &[]);
        add_user(&sqlite, "fan", &["quiet"]);
        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(10));

        let nobody = engine
            .start(FeedParams::new("loner", FeedMode::FollowingOnly))
            .unwrap();
        assert_eq!(nobody.empty_state, Some(EmptyState::FollowingNobody));
        assert_eq!(sqlite.listener_count(), 0);

        let quiet = engine
            .start(FeedParams::new("fan", FeedMode::FollowingOnly))
            .unwrap();
        assert_eq!(quiet.empty_state, Some(EmptyState::NoPostsFromFollowing));

        let global = engine
            .start(FeedParams::new("fan", FeedMode::Global))
            .unwrap();
        assert_eq!(global.empty_state, Some(EmptyState::NoPosts));
        assert!(!global.has_more);

        assert_eq!(
            classify_empty(&FeedMode::FollowingOnly, None, false),
            Some(EmptyState::LoadingFollowing)
        );
        assert_eq!(classify_empty(&FeedMode::Global, None, true), None);
    }

    #[test]
    fn author_feed_only_shows_that_author() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        add_post(&sqlite, "ana", "mine");
        add_post(&sqlite, "bea", "theirs");
        add_post(&sqlite, "ana", "mine again");
        let mut engine = FeedEngine::new(Arc::new(sqlite), config(10));
        let snapshot = engine
            .start(FeedParams::new("bea", FeedMode::ByAuthor("ana".into())))
            .unwrap();
        assert_eq!(snapshot.posts.len(), 2);
        assert!(snapshot.posts.iter().all(|post| post.author_id == "ana"));
    }

    #[test]
    fn weighted_order_promotes_engagement() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        add_user(&sqlite, "bea", &[]);
        let popular = add_post(&sqlite, "ana", "popular");
        add_post(&sqlite, "ana", "newer");
        let graph = SocialGraph::new(Arc::new(sqlite.clone()), 3);
        graph
            .set_engagement(crate::models::EngagementKind::Like, &popular, "bea", true)
            .unwrap();

        let mut engine = FeedEngine::new(Arc::new(sqlite), config(10));
        let newest = engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();
        assert_ne!(newest.posts[0].id, popular);
        let ranked = engine
            .restart(FeedParams::new("bea", FeedMode::Global).weighted())
            .unwrap();
        assert_eq!(ranked.posts[0].id, popular);
    }

    #[test]
    fn stop_releases_listeners_and_silences_updates() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        for i in 0..12 {
            add_post(&sqlite, "ana", &format!("{i}"));
        }
        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(10));
        engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();
        engine.fetch_more().unwrap();
        assert_eq!(sqlite.listener_count(), 2);

        engine.stop();
        assert_eq!(sqlite.listener_count(), 0);
        add_post(&sqlite, "ana", "after stop");
        assert!(engine.poll_update().is_none());
        assert!(!engine.is_running());

        engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();
        drop(engine);
        assert_eq!(sqlite.listener_count(), 0);
    }

    #[test]
    fn refresh_following_repartitions_after_a_follow() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        add_user(&sqlite, "ana", &[]);
        add_user(&sqlite, "bea", &[]);
        add_post(&sqlite, "bea", "hello ana");

        let store: SharedStore = Arc::new(sqlite.clone());
        let mut engine = FeedEngine::new(store.clone(), config(10));
        let before = engine
            .start(FeedParams::new("ana", FeedMode::FollowingOnly))
            .unwrap();
        assert_eq!(before.empty_state, Some(EmptyState::FollowingNobody));
        assert!(!engine.refresh_following().unwrap());

        SocialGraph::new(store, 3).follow("ana", "bea").unwrap();
        assert!(engine.refresh_following().unwrap());
        let after = engine.snapshot();
        assert_eq!(after.posts.len(), 1);
        assert_eq!(after.posts[0].author_id, "bea");
        assert_eq!(sqlite.listener_count(), 1);
    }

    #[tokio::test]
    async fn next_update_waits_for_relevant_changes() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        let mut engine = FeedEngine::new(Arc::new(sqlite.clone()), config(10));
        engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();

        let writer = sqlite.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            add_post(&writer, "ana", "async hello");
        });
        let update = engine.next_update().await.expect("update");
        handle.await.unwrap();
        let update = if update.posts.is_empty() {
            engine.next_update().await.expect("second update")
        } else {
            update
        };
        assert_eq!(update.posts.len(), 1);
        assert_eq!(update.empty_state, None);
    }

    /// Delegates to SQLite but keeps the sinks so tests can inject failures.
    struct FailingStore {
        inner: SqliteDocumentStore,
        sinks: Mutex<Vec<ListenSink>>,
    }

    impl DocumentStore for FailingStore {
        fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
            self.inner.commit(batch)
        }
        fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
            self.inner.get(collection, id)
        }
        fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
            self.inner.query(query)
        }
        fn listen(&self, query: Query, sink: ListenSink) -> StoreResult<ListenerId> {
            self.sinks.lock().unwrap().push(sink.clone());
            self.inner.listen(query, sink)
        }
        fn unlisten(&self, id: ListenerId) -> bool {
            self.inner.unlisten(id)
        }
    }

    #[test]
    fn listener_errors_keep_last_good_posts() {
        let sqlite = SqliteDocumentStore::open_in_memory().unwrap();
        add_post(&sqlite, "ana", "still here");
        let failing = Arc::new(FailingStore {
            inner: sqlite,
            sinks: Mutex::new(Vec::new()),
        });
        let mut engine = FeedEngine::new(failing.clone(), config(10));
        engine
            .start(FeedParams::new("bea", FeedMode::Global))
            .unwrap();

        let sink = failing.sinks.lock().unwrap()[0].clone();
        sink.deliver(Err(StoreError::InvalidQuery("index missing".into())));
        let snapshot = engine.poll_update().expect("error update");
        assert_eq!(snapshot.posts.len(), 1);
        assert!(snapshot.error.unwrap().contains("index missing"));
    }
}
