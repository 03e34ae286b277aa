//! In-process LRU cache in front of a [`DocumentStore`].
//!
//! Entities are cached under every key they can be looked up by (see
//! [`CacheKeys`]): a document by id and by source, a user by id and by
//! `(provider, subject)`, an auth token by id and by value. All keys of one
//! entity point at the same slot, so evicting any of them evicts the entity
//! everywhere. Entries expire after a fixed TTL; when the cache is full the
//! least recently used slot goes.
//!
//! Authorization answers and readable-document counts are cached separately,
//! keyed by `(user, target, read|write, kind)`. Any mutation that can change
//! who may see what (documents, collections, shares, users) purges that
//! cache wholesale rather than trying to pinpoint affected entries.

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use quarry_core::error::is_not_found;
use quarry_core::models::{AuthToken, Collection, CollectionShare, Document, ShareLevel, User};
use quarry_core::store::{DocumentQuery, DocumentStore, LoadedSection};

/// Every key an entity is reachable by. The first key is its primary key.
pub trait CacheKeys {
    fn cache_keys(&self) -> Vec<String>;
}

impl CacheKeys for Document {
    fn cache_keys(&self) -> Vec<String> {
        vec![document_id_key(&self.id), document_source_key(&self.source)]
    }
}

impl CacheKeys for Collection {
    fn cache_keys(&self) -> Vec<String> {
        vec![collection_key(&self.id)]
    }
}

impl CacheKeys for User {
    fn cache_keys(&self) -> Vec<String> {
        vec![user_id_key(&self.id), user_subject_key(&self.provider, &self.subject)]
    }
}

impl CacheKeys for AuthToken {
    fn cache_keys(&self) -> Vec<String> {
        vec![token_id_key(&self.id), token_value_key(&self.value)]
    }
}

impl CacheKeys for LoadedSection {
    fn cache_keys(&self) -> Vec<String> {
        vec![section_key(&self.section.id)]
    }
}

fn document_id_key(id: &str) -> String {
    format!("document/id/{}", id)
}
fn document_source_key(source: &str) -> String {
    format!("document/source/{}", source)
}
fn collection_key(id: &str) -> String {
    format!("collection/id/{}", id)
}
fn user_id_key(id: &str) -> String {
    format!("user/id/{}", id)
}
fn user_subject_key(provider: &str, subject: &str) -> String {
    format!("user/subject/{}/{}", provider, subject)
}
fn token_id_key(id: &str) -> String {
    format!("token/id/{}", id)
}
fn token_value_key(value: &str) -> String {
    format!("token/value/{}", value)
}
fn section_key(id: &str) -> String {
    format!("section/id/{}", id)
}

#[derive(Debug, Clone)]
enum Cached {
    Document(Document),
    Collection(Collection),
    User(User),
    Token(AuthToken),
    Section(LoadedSection),
}

impl Cached {
    fn keys(&self) -> Vec<String> {
        match self {
            Cached::Document(d) => d.cache_keys(),
            Cached::Collection(c) => c.cache_keys(),
            Cached::User(u) => u.cache_keys(),
            Cached::Token(t) => t.cache_keys(),
            Cached::Section(s) => s.cache_keys(),
        }
    }
}

struct Slot {
    value: Cached,
    keys: Vec<String>,
    expires: Instant,
}

struct Entries {
    /// Primary key to slot, least recently used first out.
    slots: LruCache<String, Slot>,
    /// Any key to primary key.
    index: HashMap<String, String>,
}

impl Entries {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: LruCache::new(capacity),
            index: HashMap::new(),
        }
    }

    fn unlink(&mut self, primary: &str, slot: &Slot) {
        for key in &slot.keys {
            if self.index.get(key).map(String::as_str) == Some(primary) {
                self.index.remove(key);
            }
        }
    }

    fn remove_slot(&mut self, primary: &str) {
        if let Some(slot) = self.slots.pop(primary) {
            self.unlink(primary, &slot);
        }
    }

    fn evict_key(&mut self, key: &str) {
        if let Some(primary) = self.index.get(key).cloned() {
            self.remove_slot(&primary);
        }
    }

    /// Returns a live entry and marks it most recently used.
    fn get(&mut self, key: &str, now: Instant) -> Option<Cached> {
        let primary = self.index.get(key)?.clone();
        match self.slots.get(&primary) {
            Some(slot) if slot.expires > now => return Some(slot.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.remove_slot(&primary);
        None
    }

    fn insert(&mut self, primary: String, slot: Slot) {
        let keys = slot.keys.clone();
        // `push` hands back whatever it displaced: the least recently used
        // slot when full.
        if let Some((old_primary, old)) = self.slots.push(primary.clone(), slot) {
            self.unlink(&old_primary, &old);
        }
        for key in keys {
            self.index.insert(key, primary.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AuthKind {
    Document,
    Collection,
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AuthKey {
    user_id: String,
    target_id: String,
    write: bool,
    kind: AuthKind,
}

#[derive(Debug, Clone, Copy)]
enum AuthValue {
    Allowed(bool),
    Count(u64),
}

pub struct CachedDocumentStore {
    inner: Arc<dyn DocumentStore>,
    capacity: NonZeroUsize,
    ttl: Duration,
    entries: Mutex<Entries>,
    auth: RwLock<HashMap<AuthKey, (AuthValue, Instant)>>,
}

impl CachedDocumentStore {
    pub fn new(inner: Arc<dyn DocumentStore>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            capacity,
            ttl,
            entries: Mutex::new(Entries::new(capacity)),
            auth: RwLock::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn DocumentStore> {
        &self.inner
    }

    /// Number of cached entities.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops everything, e.g. after the underlying store was restored.
    pub async fn clear(&self) {
        *self.entries.lock().await = Entries::new(self.capacity);
        self.auth.write().await.clear();
    }

    async fn lookup(&self, key: &str) -> Option<Cached> {
        self.entries.lock().await.get(key, Instant::now())
    }

    async fn remember(&self, value: Cached) {
        let keys = value.keys();
        let Some(primary) = keys.first().cloned() else {
            return;
        };
        let mut entries = self.entries.lock().await;
        for key in &keys {
            entries.evict_key(key);
        }

        // Prefer dropping expired slots over live ones when full.
        let now = Instant::now();
        if entries.slots.len() >= self.capacity.get() {
            let expired: Vec<String> = entries
                .slots
                .iter()
                .filter(|(_, s)| s.expires <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                entries.remove_slot(&k);
            }
        }

        entries.insert(
            primary,
            Slot {
                value,
                keys,
                expires: now + self.ttl,
            },
        );
    }

    async fn evict(&self, keys: &[String]) {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.evict_key(key);
        }
    }

    /// Evicts a document and every section it owns.
    async fn evict_document(&self, doc: &Document) {
        let mut keys = doc.cache_keys();
        keys.extend(doc.sections.iter().map(|s| section_key(&s.id)));
        self.evict(&keys).await;
    }

    async fn evict_document_id(&self, id: &str) {
        match self.inner.get_document_by_id(id).await {
            Ok(doc) => self.evict_document(&doc).await,
            Err(_) => self.evict(&[document_id_key(id)]).await,
        }
    }

    async fn purge_auth(&self) {
        let mut auth = self.auth.write().await;
        if !auth.is_empty() {
            debug!(entries = auth.len(), "purging authorization cache");
            auth.clear();
        }
    }

    async fn auth_lookup(&self, key: &AuthKey) -> Option<AuthValue> {
        let auth = self.auth.read().await;
        match auth.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(*value),
            _ => None,
        }
    }

    async fn auth_remember(&self, key: AuthKey, value: AuthValue) {
        let mut auth = self.auth.write().await;
        if auth.len() >= self.capacity.get() {
            let now = Instant::now();
            auth.retain(|_, (_, expires)| *expires > now);
            if auth.len() >= self.capacity.get() {
                auth.clear();
            }
        }
        auth.insert(key, (value, Instant::now() + self.ttl));
    }

    async fn allowed<F>(&self, key: AuthKey, fetch: F) -> Result<bool>
    where
        F: std::future::Future<Output = Result<bool>>,
    {
        if let Some(AuthValue::Allowed(allowed)) = self.auth_lookup(&key).await {
            return Ok(allowed);
        }
        let allowed = fetch.await?;
        self.auth_remember(key, AuthValue::Allowed(allowed)).await;
        Ok(allowed)
    }
}

fn auth_key(user_id: &str, target_id: &str, write: bool, kind: AuthKind) -> AuthKey {
    AuthKey {
        user_id: user_id.to_string(),
        target_id: target_id.to_string(),
        write,
        kind,
    }
}

#[async_trait]
impl DocumentStore for CachedDocumentStore {
    async fn save_documents(&self, docs: &[Document]) -> Result<()> {
        let mut replaced = Vec::new();
        for doc in docs {
            match self.inner.get_document_by_source(&doc.source).await {
                Ok(old) => replaced.push(old),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
        }
        for doc in replaced.iter().chain(docs) {
            self.evict_document(doc).await;
        }
        let saved = self.inner.save_documents(docs).await;
        // A read racing the save may have cached the old version again.
        for doc in replaced.iter().chain(docs) {
            self.evict_document(doc).await;
        }
        self.purge_auth().await;
        saved
    }

    async fn get_document_by_id(&self, id: &str) -> Result<Document> {
        if let Some(Cached::Document(doc)) = self.lookup(&document_id_key(id)).await {
            return Ok(doc);
        }
        let doc = self.inner.get_document_by_id(id).await?;
        self.remember(Cached::Document(doc.clone())).await;
        Ok(doc)
    }

    async fn get_document_by_source(&self, source: &str) -> Result<Document> {
        if let Some(Cached::Document(doc)) = self.lookup(&document_source_key(source)).await {
            return Ok(doc);
        }
        let doc = self.inner.get_document_by_source(source).await?;
        self.remember(Cached::Document(doc.clone())).await;
        Ok(doc)
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.evict_document_id(id).await;
        let deleted = self.inner.delete_document(id).await;
        self.purge_auth().await;
        deleted
    }

    async fn query_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        self.inner.query_documents(query).await
    }

    async fn get_section_by_id(&self, id: &str) -> Result<LoadedSection> {
        if let Some(Cached::Section(section)) = self.lookup(&section_key(id)).await {
            return Ok(section);
        }
        let section = self.inner.get_section_by_id(id).await?;
        self.remember(Cached::Section(section.clone())).await;
        Ok(section)
    }

    async fn section_exists(&self, id: &str) -> Result<bool> {
        self.inner.section_exists(id).await
    }

    async fn query_user_readable_documents(
        &self,
        user_id: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>> {
        self.inner.query_user_readable_documents(user_id, query).await
    }

    async fn query_user_writable_documents(
        &self,
        user_id: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>> {
        self.inner.query_user_writable_documents(user_id, query).await
    }

    async fn count_readable_documents(&self, user_id: &str) -> Result<u64> {
        let key = auth_key(user_id, "", false, AuthKind::Count);
        if let Some(AuthValue::Count(n)) = self.auth_lookup(&key).await {
            return Ok(n);
        }
        let n = self.inner.count_readable_documents(user_id).await?;
        self.auth_remember(key, AuthValue::Count(n)).await;
        Ok(n)
    }

    async fn can_read_document(&self, user_id: &str, document_id: &str) -> Result<bool> {
        let key = auth_key(user_id, document_id, false, AuthKind::Document);
        self.allowed(key, self.inner.can_read_document(user_id, document_id))
            .await
    }

    async fn can_write_document(&self, user_id: &str, document_id: &str) -> Result<bool> {
        let key = auth_key(user_id, document_id, true, AuthKind::Document);
        self.allowed(key, self.inner.can_write_document(user_id, document_id))
            .await
    }

    async fn create_collection(&self, collection: &Collection) -> Result<()> {
        let created = self.inner.create_collection(collection).await;
        self.purge_auth().await;
        created
    }

    async fn update_collection(&self, collection: &Collection) -> Result<()> {
        self.evict(&collection.cache_keys()).await;
        self.inner.update_collection(collection).await
    }

    async fn get_collection_by_id(&self, id: &str) -> Result<Collection> {
        if let Some(Cached::Collection(c)) = self.lookup(&collection_key(id)).await {
            return Ok(c);
        }
        let collection = self.inner.get_collection_by_id(id).await?;
        self.remember(Cached::Collection(collection.clone())).await;
        Ok(collection)
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let member_ids: Vec<String> = self
            .inner
            .query_documents(&DocumentQuery {
                collections: vec![id.to_string()],
                ..Default::default()
            })
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let deleted = self.inner.delete_collection(id).await;
        self.evict(&[collection_key(id)]).await;
        for doc_id in &member_ids {
            self.evict(&[document_id_key(doc_id)]).await;
        }
        self.purge_auth().await;
        deleted
    }

    async fn query_user_readable_collections(&self, user_id: &str) -> Result<Vec<Collection>> {
        self.inner.query_user_readable_collections(user_id).await
    }

    async fn query_user_writable_collections(&self, user_id: &str) -> Result<Vec<Collection>> {
        self.inner.query_user_writable_collections(user_id).await
    }

    async fn can_read_collection(&self, user_id: &str, collection_id: &str) -> Result<bool> {
        let key = auth_key(user_id, collection_id, false, AuthKind::Collection);
        self.allowed(key, self.inner.can_read_collection(user_id, collection_id))
            .await
    }

    async fn can_write_collection(&self, user_id: &str, collection_id: &str) -> Result<bool> {
        let key = auth_key(user_id, collection_id, true, AuthKind::Collection);
        self.allowed(key, self.inner.can_write_collection(user_id, collection_id))
            .await
    }

    async fn add_documents_to_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<()> {
        let added = self
            .inner
            .add_documents_to_collection(collection_id, document_ids)
            .await;
        let keys: Vec<String> = document_ids.iter().map(|id| document_id_key(id)).collect();
        self.evict(&keys).await;
        self.purge_auth().await;
        added
    }

    async fn remove_documents_from_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<()> {
        let removed = self
            .inner
            .remove_documents_from_collection(collection_id, document_ids)
            .await;
        let keys: Vec<String> = document_ids.iter().map(|id| document_id_key(id)).collect();
        self.evict(&keys).await;
        self.purge_auth().await;
        removed
    }

    async fn create_collection_share(
        &self,
        collection_id: &str,
        user_id: &str,
        level: ShareLevel,
    ) -> Result<()> {
        let created = self
            .inner
            .create_collection_share(collection_id, user_id, level)
            .await;
        self.purge_auth().await;
        created
    }

    async fn delete_collection_share(&self, collection_id: &str, user_id: &str) -> Result<()> {
        let deleted = self
            .inner
            .delete_collection_share(collection_id, user_id)
            .await;
        self.purge_auth().await;
        deleted
    }

    async fn get_collection_shares(&self, collection_id: &str) -> Result<Vec<CollectionShare>> {
        self.inner.get_collection_shares(collection_id).await
    }

    async fn create_user(&self, user: &User) -> Result<User> {
        self.evict(&[user_subject_key(&user.provider, &user.subject)])
            .await;
        let stored = self.inner.create_user(user).await?;
        self.evict(&stored.cache_keys()).await;
        self.purge_auth().await;
        Ok(stored)
    }

    async fn get_user_by_id(&self, id: &str) -> Result<User> {
        if let Some(Cached::User(u)) = self.lookup(&user_id_key(id)).await {
            return Ok(u);
        }
        let user = self.inner.get_user_by_id(id).await?;
        self.remember(Cached::User(user.clone())).await;
        Ok(user)
    }

    async fn get_user_by_provider_subject(&self, provider: &str, subject: &str) -> Result<User> {
        if let Some(Cached::User(u)) = self.lookup(&user_subject_key(provider, subject)).await {
            return Ok(u);
        }
        let user = self
            .inner
            .get_user_by_provider_subject(provider, subject)
            .await?;
        self.remember(Cached::User(user.clone())).await;
        Ok(user)
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        self.evict(&[user_id_key(&user.id)]).await;
        let updated = self.inner.update_user(user).await;
        self.purge_auth().await;
        updated
    }

    async fn create_auth_token(&self, owner_id: &str, label: &str) -> Result<AuthToken> {
        self.inner.create_auth_token(owner_id, label).await
    }

    async fn get_auth_token_by_id(&self, id: &str) -> Result<AuthToken> {
        if let Some(Cached::Token(t)) = self.lookup(&token_id_key(id)).await {
            return Ok(t);
        }
        let token = self.inner.get_auth_token_by_id(id).await?;
        self.remember(Cached::Token(token.clone())).await;
        Ok(token)
    }

    async fn get_auth_token_by_value(&self, value: &str) -> Result<AuthToken> {
        if let Some(Cached::Token(t)) = self.lookup(&token_value_key(value)).await {
            return Ok(t);
        }
        let token = self.inner.get_auth_token_by_value(value).await?;
        self.remember(Cached::Token(token.clone())).await;
        Ok(token)
    }

    async fn get_user_auth_tokens(&self, user_id: &str) -> Result<Vec<AuthToken>> {
        self.inner.get_user_auth_tokens(user_id).await
    }

    async fn delete_auth_token(&self, id: &str) -> Result<()> {
        self.evict(&[token_id_key(id)]).await;
        self.inner.delete_auth_token(id).await
    }
}
