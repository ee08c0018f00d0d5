//! Data models for bibsync

mod changes;
mod collection;
mod conflict;
mod item;
mod library;
mod meta;
mod remote;
mod search;
mod syncable;
mod upload;

pub use changes::{all_changes, CollectionChanges, FieldMask, ItemChanges, SearchChanges};
pub use collection::{Collection, CollectionData, RemoteCollection};
pub use conflict::{ConflictKind, ConflictResolution, SyncConflict};
pub use item::{
    AttachmentState, Creator, DerivedFields, Item, ItemData, ItemField, RemoteItem, Tag,
    ANNOTATION_TYPE, ATTACHMENT_TYPE, NOTE_TYPE,
};
pub use library::{CustomLibraryKind, Library, LibraryIdentifier};
pub use meta::{ChangeType, ObjectType, SyncMeta, SyncState};
pub use search::{RemoteSearch, Search, SearchCondition, SearchData};
pub use syncable::Syncable;
pub use upload::{UploadSession, UploadState, AUTHORIZATION_EXPIRED};
