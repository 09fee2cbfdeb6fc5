use crate::auth::AuthProvider;
use crate::comments::CommentTree;
use crate::feed::{FeedMode, FeedOrder, FeedParams, FeedSnapshot};
use crate::media::PendingFile;
use crate::models::{Comment, EngagementKind, Post};
use crate::node::UayNode;
use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a profile for a user id
    Register {
        user_id: String,
        username: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Publish a post, optionally with attachments
    Post {
        #[arg(default_value = "")]
        body: String,
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    Follow {
        user_id: String,
    },
    Unfollow {
        user_id: String,
    },
    /// Like a post (or remove the like with --undo)
    Like {
        post_id: String,
        #[arg(long)]
        undo: bool,
    },
    /// Repost, optionally with a comment of your own
    Repost {
        post_id: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Comment on a post or reply to a comment
    Comment {
        post_id: String,
        body: String,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Print a post's comment tree
    Comments {
        post_id: String,
    },
    /// Find users by username prefix
    Search {
        term: String,
    },
    /// Upload a profile picture
    Avatar {
        path: PathBuf,
    },
    Feed(FeedArgs),
}

#[derive(Args, Debug)]
pub struct FeedArgs {
    /// Only posts from people you follow
    #[arg(long, conflicts_with = "author")]
    following: bool,
    /// Only posts by this user id
    #[arg(long)]
    author: Option<String>,
    /// Rank by engagement instead of recency
    #[arg(long)]
    weighted: bool,
    /// Pages to load
    #[arg(long, default_value_t = 1)]
    pages: usize,
    /// Keep printing the feed as it changes, until Ctrl-C
    #[arg(long)]
    watch: bool,
}

pub async fn run_command(node: &UayNode, command: Command) -> Result<()> {
    match command {
        Command::Register {
            user_id,
            username,
            email,
        } => {
            let profile = node.users().register(&user_id, &username, &email)?;
            println!("Registered {} as {}", profile.id, profile.username);
        }
        Command::Post { body, attachments } => {
            let mut files = Vec::with_capacity(attachments.len());
            for path in &attachments {
                files.push(PendingFile::from_path(path).await?);
            }
            let mut pipeline = node.compose()?;
            let report = pipeline.attach(files);
            for name in &report.oversized {
                println!("Skipped {name}: larger than the upload limit");
            }
            for name in &report.excess {
                println!("Skipped {name}: too many attachments");
            }
            pipeline.wait_for_uploads().await;
            for name in pipeline.failed_uploads() {
                println!("Upload failed: {name}");
            }
            let post_id = pipeline.submit(&body)?;
            println!("Posted {post_id}");
        }
        Command::Follow { user_id } => {
            let session = node.auth().require_session()?;
            node.social().follow(&session.user_id, &user_id)?;
            println!("Following {user_id}");
        }
        Command::Unfollow { user_id } => {
            let session = node.auth().require_session()?;
            node.social().unfollow(&session.user_id, &user_id)?;
            println!("Unfollowed {user_id}");
        }
        Command::Like { post_id, undo } => {
            let session = node.auth().require_session()?;
            let change =
                node.social()
                    .set_engagement(EngagementKind::Like, &post_id, &session.user_id, !undo)?;
            println!("{post_id}: {change:?}");
        }
        Command::Repost { post_id, comment } => {
            let session = node.auth().require_session()?;
            let author = node.users().author_for(&session.user_id)?;
            let repost_id = node.social().repost_with_comment(&author, &post_id, &comment)?;
            println!("Reposted {post_id} as {repost_id}");
        }
        Command::Comment {
            post_id,
            body,
            reply_to,
        } => {
            let session = node.auth().require_session()?;
            let author = node.users().author_for(&session.user_id)?;
            let comment =
                node.comments()
                    .add_comment(&post_id, reply_to.as_deref(), &author, &body)?;
            println!("Commented {}", comment.comment_id);
        }
        Command::Comments { post_id } => {
            let tree = node.comments().comments_for(&post_id)?;
            print_tree(&tree);
        }
        Command::Search { term } => {
            let users = node.users().search(&term)?;
            if users.is_empty() {
                println!("No users match '{term}'");
            }
            for user in users {
                println!("{} {}", user.id, user.username);
            }
        }
        Command::Avatar { path } => {
            let session = node.auth().require_session()?;
            let file = PendingFile::from_path(&path).await?;
            let uri = node.users().upload_avatar(&session.user_id, file).await?;
            println!("Avatar set to {uri}");
        }
        Command::Feed(args) => run_feed(node, args).await?,
    }
    Ok(())
}

async fn run_feed(node: &UayNode, args: FeedArgs) -> Result<()> {
    let viewer_id = node
        .auth()
        .current_session()
        .map(|session| session.user_id)
        .unwrap_or_default();
    if args.following && viewer_id.is_empty() {
        bail!("--following needs a signed-in user (pass --as <user-id>)");
    }
    let mode = match (args.following, args.author) {
        (true, _) => FeedMode::FollowingOnly,
        (false, Some(author)) => FeedMode::ByAuthor(author),
        (false, None) => FeedMode::Global,
    };
    let order = if args.weighted {
        FeedOrder::Weighted
    } else {
        FeedOrder::Newest
    };

    let mut engine = node.feed();
    let mut snapshot = engine.start(FeedParams {
        viewer_id,
        mode,
        order,
    })?;
    for _ in 1..args.pages {
        if !engine.fetch_more()? {
            break;
        }
        snapshot = engine.snapshot();
    }
    print_feed(&snapshot);

    if args.watch {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                update = engine.next_update() => match update {
                    Some(update) => {
                        println!("--");
                        print_feed(&update);
                    }
                    None => break,
                },
            }
        }
    }
    engine.stop();
    Ok(())
}

fn print_feed(snapshot: &FeedSnapshot) {
    if let Some(error) = &snapshot.error {
        println!("! feed error: {error}");
    }
    if let Some(empty) = snapshot.empty_state {
        println!("(empty: {empty:?})");
    }
    for post in &snapshot.posts {
        print_post(post);
    }
    if snapshot.has_more {
        println!("... more available (--pages)");
    }
}

fn print_post(post: &Post) {
    let created = post
        .created_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "pending".into());
    println!(
        "[{}] {} {} likes={} reposts={} comments={}",
        post.id,
        created,
        post.author_name,
        post.like_count,
        post.repost_count,
        CommentTree::new(post.comments.clone()).total_len()
    );
    if let Some(lineage) = &post.lineage {
        println!("    reposting {}: {}", lineage.original_author_name, lineage.original_body);
    }
    if !post.body.is_empty() {
        println!("    {}", post.body);
    }
    for url in &post.media_urls {
        println!("    media: {url}");
    }
}

fn print_tree(tree: &CommentTree) {
    fn walk(comments: &[Comment], depth: usize) {
        for comment in comments {
            println!(
                "{}- {} {}: {}",
                "  ".repeat(depth),
                comment.comment_id,
                comment.author_name,
                comment.body
            );
            walk(&comment.sub_comments, depth + 1);
        }
    }
    if tree.comments().is_empty() {
        println!("No comments yet");
    }
    walk(tree.comments(), 0);
}
