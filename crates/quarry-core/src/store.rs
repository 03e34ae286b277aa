//! Storage abstraction for Quarry.
//!
//! The [`DocumentStore`] trait covers durable persistence of documents,
//! sections, collections, shares, users and auth tokens, plus the
//! authorization predicates built on top of them. The SQLite backend lives
//! in the `quarry` app crate, as does the caching decorator.
//!
//! # Authorization
//!
//! A user can read an item they own or an item in a collection shared with
//! them at any level. Write access requires ownership or a `write` share.
//! The `can_*` predicates return [`Error::NotFound`](crate::error::Error::NotFound)
//! when the target is absent, so callers can tell denied from missing.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{AuthToken, Collection, CollectionShare, Document, Section, ShareLevel, User};

/// A section together with the data needed to render it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSection {
    pub section: Section,
    /// Source URL of the owning document.
    pub source: String,
    /// Trimmed content with `data:` URIs stripped.
    pub content: String,
}

/// Filters for document queries. Empty filters match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    pub ids: Vec<String>,
    /// Documents in any of these collections.
    pub collections: Vec<String>,
    pub owner_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Resolves section ids to content; all a results transformer needs.
#[async_trait]
pub trait SectionLookup: Send + Sync {
    async fn load_section(&self, id: &str) -> Result<LoadedSection>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> SectionLookup for T {
    async fn load_section(&self, id: &str) -> Result<LoadedSection> {
        self.get_section_by_id(id).await
    }
}

/// Resolves collection ids to their metadata.
#[async_trait]
pub trait CollectionLookup: Send + Sync {
    async fn load_collection(&self, id: &str) -> Result<Collection>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> CollectionLookup for T {
    async fn load_collection(&self, id: &str) -> Result<Collection> {
        self.get_collection_by_id(id).await
    }
}

/// Durable store of documents and their access control.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // ---- documents ----

    /// Inserts documents, replacing any existing document with the same
    /// source together with its sections. Atomic per document.
    async fn save_documents(&self, docs: &[Document]) -> Result<()>;

    async fn get_document_by_id(&self, id: &str) -> Result<Document>;

    async fn get_document_by_source(&self, source: &str) -> Result<Document>;

    /// Removes the document, its sections and collection memberships.
    async fn delete_document(&self, id: &str) -> Result<()>;

    /// Documents ordered by source URL.
    async fn query_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>>;

    async fn get_section_by_id(&self, id: &str) -> Result<LoadedSection>;

    async fn section_exists(&self, id: &str) -> Result<bool>;

    async fn query_user_readable_documents(
        &self,
        user_id: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>>;

    async fn query_user_writable_documents(
        &self,
        user_id: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<Document>>;

    async fn count_readable_documents(&self, user_id: &str) -> Result<u64>;

    async fn can_read_document(&self, user_id: &str, document_id: &str) -> Result<bool>;

    async fn can_write_document(&self, user_id: &str, document_id: &str) -> Result<bool>;

    // ---- collections ----

    async fn create_collection(&self, collection: &Collection) -> Result<()>;

    /// Updates label and description.
    async fn update_collection(&self, collection: &Collection) -> Result<()>;

    async fn get_collection_by_id(&self, id: &str) -> Result<Collection>;

    /// Removes the collection with its shares and memberships; member
    /// documents are kept.
    async fn delete_collection(&self, id: &str) -> Result<()>;

    async fn query_user_readable_collections(&self, user_id: &str) -> Result<Vec<Collection>>;

    async fn query_user_writable_collections(&self, user_id: &str) -> Result<Vec<Collection>>;

    async fn can_read_collection(&self, user_id: &str, collection_id: &str) -> Result<bool>;

    async fn can_write_collection(&self, user_id: &str, collection_id: &str) -> Result<bool>;

    async fn add_documents_to_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<()>;

    async fn remove_documents_from_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<()>;

    /// Upserts by `(collection, user)`.
    async fn create_collection_share(
        &self,
        collection_id: &str,
        user_id: &str,
        level: ShareLevel,
    ) -> Result<()>;

    async fn delete_collection_share(&self, collection_id: &str, user_id: &str) -> Result<()>;

    async fn get_collection_shares(&self, collection_id: &str) -> Result<Vec<CollectionShare>>;

    // ---- users ----

    /// Inserts the user or, when `(provider, subject)` already exists,
    /// refreshes its profile. Returns the stored user.
    async fn create_user(&self, user: &User) -> Result<User>;

    async fn get_user_by_id(&self, id: &str) -> Result<User>;

    async fn get_user_by_provider_subject(&self, provider: &str, subject: &str) -> Result<User>;

    /// Updates profile fields, roles and the active flag.
    async fn update_user(&self, user: &User) -> Result<()>;

    // ---- auth tokens ----

    /// Issues a token with a fresh random secret.
    async fn create_auth_token(&self, owner_id: &str, label: &str) -> Result<AuthToken>;

    async fn get_auth_token_by_id(&self, id: &str) -> Result<AuthToken>;

    async fn get_auth_token_by_value(&self, value: &str) -> Result<AuthToken>;

    async fn get_user_auth_tokens(&self, user_id: &str) -> Result<Vec<AuthToken>>;

    async fn delete_auth_token(&self, id: &str) -> Result<()>;
}
