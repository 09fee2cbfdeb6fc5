use crate::auth::{AuthProvider, LocalAuth, Session};
use crate::bootstrap::{self, BootstrapResources};
use crate::comments::CommentService;
use crate::config::UayConfig;
use crate::database::Database;
use crate::error::UayResult;
use crate::feed::FeedEngine;
use crate::media::{FsObjectStore, ObjectStore};
use crate::social::SocialGraph;
use crate::store::{SharedStore, SqliteDocumentStore};
use crate::submission::SubmissionPipeline;
use crate::users::UserDirectory;
use anyhow::Result;
use std::sync::Arc;

/// Bootstraps persistent state once and hands out services sharing the same
/// document store, object store and auth provider.
pub struct UayNode {
    config: UayConfig,
    bootstrap: BootstrapResources,
    store: SqliteDocumentStore,
    objects: Arc<FsObjectStore>,
    auth: LocalAuth,
}

impl UayNode {
    pub fn start(config: UayConfig) -> Result<Self> {
        let bootstrap = bootstrap::initialize(&config)?;
        let store = SqliteDocumentStore::new(bootstrap.database.clone());
        let objects = Arc::new(FsObjectStore::new(&config.paths));

        tracing::info!(
            directories_created = ?bootstrap.directories_created,
            database_initialized = bootstrap.database_initialized,
            db_path = %config.paths.db_path.display(),
            "uay node initialized"
        );

        Ok(Self {
            config,
            bootstrap,
            store,
            objects,
            auth: LocalAuth::new(),
        })
    }

    pub fn config(&self) -> &UayConfig {
        &self.config
    }

    pub fn database(&self) -> Database {
        self.bootstrap.database.clone()
    }

    pub fn store(&self) -> SharedStore {
        Arc::new(self.store.clone())
    }

    pub fn objects(&self) -> Arc<dyn ObjectStore> {
        self.objects.clone()
    }

    pub fn auth(&self) -> &LocalAuth {
        &self.auth
    }

    /// Signs in an existing user, taking the display name from the profile.
    pub fn sign_in(&self, user_id: &str) -> UayResult<Session> {
        let author = self.users().author_for(user_id)?;
        let session = Session {
            user_id: author.id,
            display_name: author.display_name,
        };
        self.auth.sign_in(session.clone());
        Ok(session)
    }

    pub fn users(&self) -> UserDirectory {
        UserDirectory::new(self.store(), self.objects())
    }

    pub fn social(&self) -> SocialGraph {
        SocialGraph::new(self.store(), self.config.write.max_write_attempts)
    }

    pub fn comments(&self) -> CommentService {
        CommentService::new(self.store(), self.config.write.max_write_attempts)
    }

    pub fn feed(&self) -> FeedEngine {
        FeedEngine::new(self.store(), self.config.feed.clone())
    }

    /// Compose session for the signed-in user.
    pub fn compose(&self) -> UayResult<SubmissionPipeline> {
        let session = self.auth.require_session()?;
        let author = self.users().author_for(&session.user_id)?;
        Ok(SubmissionPipeline::new(
            self.store(),
            self.objects(),
            self.config.upload.clone(),
            author,
        ))
    }
}
